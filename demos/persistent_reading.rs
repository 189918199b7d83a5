use std::{path::PathBuf, time::Duration};

use clap::Parser;
use logtrack::{TrackedReader, TrackerOptions};

/// Print lines appended to a possibly rotated file since the previous run
#[derive(Parser)]
struct Args {
    /// path to file that is possibly rotated
    #[arg(long, short)]
    path: PathBuf,

    /// file used to keep track of read position, defaults to `<path>.offset`
    #[arg(long, short)]
    registry: Option<PathBuf>,

    /// keep waiting for new lines, polling with this interval in milliseconds
    #[arg(long, short)]
    follow: Option<u64>,

    /// only print lines terminated by a newline
    #[arg(long)]
    full_lines: bool,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();
    let options = TrackerOptions {
        offset_file: args.registry,
        follow: args.follow.map(Duration::from_millis),
        full_lines: args.full_lines,
        every_n: 100,
        ..Default::default()
    };

    let mut reader = TrackedReader::new(&args.path, options)?;
    let mut count = 0;
    while let Some(record) = reader.next_record()? {
        print!("{}", String::from_utf8_lossy(&record));
        count += 1;
    }
    reader.close()?;
    if count == 0 {
        println!("reached end of file");
    }

    Ok(())
}
