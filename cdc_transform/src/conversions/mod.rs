pub mod canonical;
pub mod change_event;
