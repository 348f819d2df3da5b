pub mod eventq;
pub mod network;
pub mod protocol;
pub mod router;
pub mod sim;
pub mod traffic;
