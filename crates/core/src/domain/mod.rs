pub mod alert;
pub mod lease;
pub mod notification;
pub mod run;
pub mod silence;
