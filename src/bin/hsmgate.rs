use hsmgate::cli::{Options, run};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let options = Options::from_args();
    let format = options.general.format;

    match run(options).await {
        Ok(report) => {
            match report.format(format) {
                Ok(text) => println!("{}", text.trim_end()),
                Err(e) => {
                    eprintln!("{}", e);
                    ::std::process::exit(1);
                }
            }
            if !report.is_success() {
                ::std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    }
}
