//! Entry point for the `xec` binary; all real logic lives in [`xec::cli`].

#[tokio::main]
async fn main() {
    let code = xec::cli::run(std::env::args().collect()).await;
    std::process::exit(code);
}
