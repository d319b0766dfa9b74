fn main() {
    // Load .env file if present (for development)
    let _ = dotenvy::dotenv();

    if let Err(e) = relay_lib::run() {
        eprintln!("radio-relay: {}", e);
        std::process::exit(1);
    }
}
