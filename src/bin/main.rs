use seqstream::cli;

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    if let Err(err) = cli::run(cli) {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }
}
