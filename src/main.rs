fn main() {
    if let Err(e) = ai_companion_lib::run() {
        eprintln!("ai-companion: {e}");
        std::process::exit(1);
    }
}
