pub mod chat;
pub mod init;
pub mod providers;
pub mod tools;
