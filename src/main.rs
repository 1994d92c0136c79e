fn main() {
    if let Err(e) = showfloor_lib::run() {
        log::error!("showfloor exited: {e}");
        eprintln!("showfloor: {e}");
        std::process::exit(1);
    }
}
