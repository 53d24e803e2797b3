pub mod bump;
pub mod card_space;
pub mod refill;
pub mod tlab;
