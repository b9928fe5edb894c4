use crate::exit::{CliResult, SUCCESS};

pub fn run() -> CliResult<i32> {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(SUCCESS)
}
