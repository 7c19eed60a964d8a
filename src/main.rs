use ccld::driver::Driver;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut driver = Driver::new();

    match driver.parse_args(&args) {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            eprintln!("ccld: error: {}", e);
            std::process::exit(1);
        }
    }

    if !driver.has_inputs() {
        eprintln!("ccld: error: no input files");
        std::process::exit(1);
    }

    match driver.run() {
        Ok(outcome) => {
            if outcome.warnings > 0 {
                eprintln!("ccld: {} warning(s)", outcome.warnings);
            }
        }
        Err(e) => {
            eprintln!("ccld: error: {}", e);
            std::process::exit(1);
        }
    }
}
