pub mod app_state;
pub mod orchestration;
pub mod owner;
