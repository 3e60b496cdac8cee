fn main() {
    env_logger::init();

    if let Err(error) = lora_manager_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
