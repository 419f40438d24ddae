pub mod init;
pub mod list;
pub mod officer;
pub mod report;
pub mod sim;
pub mod stats;
pub mod status;
pub mod watch;
