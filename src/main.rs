use std::process::ExitCode;

fn main() -> ExitCode {
    sounding_lib::run()
}
