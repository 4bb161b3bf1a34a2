use clap::Parser;
use qpu_driver::sim::{self, SimulatedBoard};
use qpu_driver::{Driver, DriverConfig};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Thread end, followed by the two delay-slot nops it requires.
const THREAD_END: [u8; 24] = [
    0x00, 0x70, 0x9e, 0x00, 0xe7, 0x09, 0x00, 0x30, // thrend
    0x00, 0x70, 0x9e, 0x00, 0xe7, 0x09, 0x00, 0x10, // nop
    0x00, 0x70, 0x9e, 0x00, 0xe7, 0x09, 0x00, 0x10, // nop
];

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the QPU hello-world dispatch on a simulated board",
    long_about = None
)]
struct Args {
    /// Number of QPU threads to launch
    #[arg(short, long, default_value_t = 16)]
    threads: usize,

    /// Launch timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// JSON driver configuration; the size flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data area size in bytes
    #[arg(long)]
    data_area_size: Option<usize>,

    /// Code area size in bytes
    #[arg(long)]
    code_area_size: Option<usize>,

    /// Maximum threads per launch
    #[arg(long)]
    max_threads: Option<usize>,

    /// Raw machine code to load instead of the built-in thread-end stub
    #[arg(long)]
    program: Option<PathBuf>,
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!(
        "    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m",
        component, status_color, check, status
    );
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn load_config(args: &Args) -> Result<DriverConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(size) = args.data_area_size {
        config.data_area_size = size;
    }
    if let Some(size) = args.code_area_size {
        config.code_area_size = size;
    }
    if let Some(threads) = args.max_threads {
        config.max_threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    // ─── DEVICE MEMORY ────────────────────────────────────────────────────────
    print_section("DEVICE MEMORY");
    let board = SimulatedBoard::new().with_kernel(sim::add_element_number);
    let driver = Driver::open(board.clone(), board, config)?;
    print_info("Bus Base", &format!("0x{:08X}", driver.base_address()));
    print_info("Code Area", &format!("{} bytes", config.code_area_size));
    print_info("Data Area", &format!("{} bytes", config.data_area_size));
    let message = driver.message();
    print_info(
        "Message Table",
        &format!("0x{:08X} ({} rows)", message.address(), message.rows()),
    );
    print_status("QPU Memory", "MAPPED", true);

    // ─── PROGRAM ──────────────────────────────────────────────────────────────
    print_section("PROGRAM");
    let code = match &args.program {
        Some(path) => std::fs::read(path)?,
        None => THREAD_END.to_vec(),
    };
    let program = driver.program(&code)?;
    print_info("Entry", &format!("0x{:08X}", program.address()));
    print_info("Size", &format!("{} bytes", program.len()));
    print_status("Code Upload", "LOADED", true);

    // ─── EXECUTION ────────────────────────────────────────────────────────────
    print_section("EXECUTION");
    let threads = args.threads;
    let mut result = driver.array::<u32>(&[threads, sim::SIMD_WIDTH as usize])?;
    let mut uniforms = driver.array::<u32>(&[threads, 2])?;
    result.fill(0);
    for thread in 0..threads {
        let out = result.row_address(thread).ok_or("result row out of range")?;
        let row = uniforms.row_mut(thread).ok_or("uniform row out of range")?;
        row[0] = (thread as u32) * sim::SIMD_WIDTH;
        row[1] = out;
    }

    let started = Instant::now();
    let outcome = program.invoke(threads, &uniforms, Duration::from_millis(args.timeout_ms));
    print_info("Threads", &threads.to_string());
    print_info("Elapsed", &format!("{:?}", started.elapsed()));
    match &outcome {
        Ok(()) => print_status("Launch", "COMPLETE", true),
        Err(e) => print_status("Launch", &e.to_string(), false),
    }
    outcome?;

    println!();
    print!("{}", result);

    driver.close()?;
    Ok(())
}
