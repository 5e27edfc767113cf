pub mod case;
pub mod chat;
pub mod dispatch;
pub mod embedding;
pub mod grader;
pub mod grouping;
pub mod judge;
pub mod report;
pub mod runner;
