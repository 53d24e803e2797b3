pub mod heap;
pub mod heap_space;
pub mod large_object_space;
pub mod mark_sweep_space;
