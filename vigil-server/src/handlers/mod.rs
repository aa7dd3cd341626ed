pub mod dashboard;
pub mod inventory;
pub mod policies;
pub mod runs;
pub mod worker;
