pub mod audit;
pub mod discover;
pub mod init;
pub mod serve;
pub mod validate;
