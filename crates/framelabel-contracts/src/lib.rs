pub mod events;
pub mod labels;
pub mod parse;
pub mod runs;
