pub mod credential;
pub mod intake;
pub mod job;
pub mod proxy;
pub mod result;
