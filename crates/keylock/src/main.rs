use std::process;

use keylock::cli::{build_cli, handlers};

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    match handlers::dispatch(&matches).await {
        Ok(code) => {
            #[allow(clippy::exit)]
            process::exit(code);
        }
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Error: {err:#}");
            }

            let code = err
                .downcast_ref::<keylock_core::Error>()
                .map_or(1, keylock_core::Error::exit_code);

            #[allow(clippy::exit)]
            process::exit(code);
        }
    }
}
