pub mod doctor;
pub mod plan;
pub mod ps;
pub mod start;
pub mod stop;
pub mod validate;
