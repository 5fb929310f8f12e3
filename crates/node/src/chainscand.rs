fn main() {
    if let Err(err) = chainscan::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
