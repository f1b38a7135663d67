pub mod config;
pub mod distributed;
pub mod dtype;
pub mod lora;
