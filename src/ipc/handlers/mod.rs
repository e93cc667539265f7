pub mod assessments;
pub mod classes;
pub mod core;
pub mod grades;
pub mod live;
pub mod structures;
pub mod students;
