use std::process::ExitCode;

fn main() -> ExitCode {
    salesrag_cli::run()
}
