pub mod enqueue;
pub mod simulate;
