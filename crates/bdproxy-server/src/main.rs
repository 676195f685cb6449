//! Block-device proxy server: exposes a backing store (raw file,
//! partition, dynamic VHD, or plugin) as a remote block device over a
//! socket, shared-memory, or client-driver transport.

mod bootstrap;
mod cli;

use std::io::{Read, Write};
use std::process::ExitCode;

use bdproxy_protocol::{run_session, LogicalDevice};
use bdproxy_transport::socket::{PathTransport, StdioTransport, TcpTransport, Transport};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();

    let args = match cli::parse(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(255); // -1, usage error
        }
    };

    let device = match bootstrap::open_device(&args) {
        Ok(device) => device,
        Err(e) => {
            if e.downcast_ref::<bootstrap::ExclusiveLockError>().is_some() {
                tracing::error!(error = %e, "cannot lock volume for write");
                return ExitCode::from(9);
            }
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    // `catch_unwind` plus Rust's own memory safety is the closest faithful
    // substitute for the original's top-level SEH/signal handler: there is
    // no portable way to catch an access violation, but an unexpected panic
    // inside the session loop should still be logged and turned into the
    // same `-1` exit code rather than an opaque abort.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_transport(&args, device)
    }));

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(code)) => code,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            tracing::error!(panic = %message, "fatal exception in session loop");
            ExitCode::from(255)
        }
    }
}

fn run_transport(args: &cli::Args, mut device: LogicalDevice) -> Result<(), ExitCode> {
    if args.use_driver {
        return run_driver(device);
    }

    match args.comm.as_str() {
        "-" => {
            let mut transport = StdioTransport::new();
            run_one(&mut transport, &mut device)
        }
        comm if comm.starts_with("shm:") => run_shm(&comm[4..], device),
        comm if comm.starts_with("drv:") => run_driver(device),
        comm => {
            if let Ok(port) = comm.parse::<u16>() {
                let mut transport = match TcpTransport::bind(port) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(error = %e, "transport setup failed");
                        return Err(ExitCode::from(2));
                    }
                };
                run_one(&mut transport, &mut device)
            } else {
                let mut transport = PathTransport::new(comm);
                run_one(&mut transport, &mut device)
            }
        }
    }
}

fn run_one<T: Transport>(transport: &mut T, device: &mut LogicalDevice) -> Result<(), ExitCode> {
    let mut stream = match transport.accept() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "transport setup failed");
            return Err(ExitCode::from(2));
        }
    };
    dispatch(&mut stream, device)
}

fn run_shm(name: &str, mut device: LogicalDevice) -> Result<(), ExitCode> {
    let mut transport = match bdproxy_transport::shm::ShmTransport::create(name, 65536) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "shared-memory transport setup failed");
            return Err(ExitCode::from(2));
        }
    };
    match transport.accept() {
        Ok(mut stream) => dispatch(&mut stream, &mut device),
        Err(e) => {
            tracing::error!(error = %e, "shared-memory accept failed");
            Err(ExitCode::from(2))
        }
    }
}

fn run_driver(mut device: LogicalDevice) -> Result<(), ExitCode> {
    let mut transport = match bdproxy_transport::driver::DriverTransport::open("bdproxy0") {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "client-driver transport setup failed");
            return Err(ExitCode::from(2));
        }
    };
    match transport.accept() {
        Ok(stream) => dispatch(stream, &mut device),
        Err(e) => {
            tracing::error!(error = %e, "client-driver accept failed");
            Err(ExitCode::from(2))
        }
    }
}

fn dispatch<S: Read + Write>(stream: &mut S, device: &mut LogicalDevice) -> Result<(), ExitCode> {
    match run_session(stream, device) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "session ended with an error");
            Err(ExitCode::from(2))
        }
    }
}
