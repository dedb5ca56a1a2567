pub mod arch;
pub mod backend;
pub mod builder;
pub mod bv;
pub mod constraint;
pub mod executor;
pub mod explorer;
pub mod expr;
pub mod frame;
pub mod ir;
pub mod solution;
pub mod solver;
pub mod state;
