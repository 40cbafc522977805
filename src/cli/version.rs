/// Print version information
pub fn execute() {
    println!("courier {}", env!("CARGO_PKG_VERSION"));
    println!("Matrix appservice bridge for external service accounts");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_execute() {
        execute();
    }
}
