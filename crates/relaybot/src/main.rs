#[tokio::main]
async fn main() {
    if let Err(e) = lib_relaybot::init().await {
        eprintln!("relaybot: {e}");
        std::process::exit(1);
    }
}
