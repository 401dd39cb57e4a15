pub mod compare;
pub mod daemon;
pub mod init;
pub mod queue;
pub mod refresh;
pub mod sprint;
pub mod status;
