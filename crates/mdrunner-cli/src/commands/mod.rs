pub mod dump;
pub mod prepare;
pub mod run;
