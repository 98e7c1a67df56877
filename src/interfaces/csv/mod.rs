//! CSV batch input and output.

pub mod command_reader;
pub mod outcome_writer;
