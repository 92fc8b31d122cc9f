pub mod messages;
pub mod ranking;
pub mod records;
pub mod status;
