fn main() {
    let code = match cask::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cask: error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
