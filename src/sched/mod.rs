pub mod balance;
pub mod clients;
pub mod group;
pub mod lease;
pub mod state;
