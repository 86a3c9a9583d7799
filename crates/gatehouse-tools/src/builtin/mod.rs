pub mod calculator;
pub mod time;

pub use calculator::CalculatorTool;
pub use time::CurrentTimeTool;
