//! The fan-out/fan-in record router (component C4): a single-threaded,
//! cooperative event loop over stdin, stdout, and every worker's pipes.
//!
//! Each iteration rebuilds its readiness set from scratch (no readiness
//! decision is carried across the multiplexer wait — see
//! [`echidna_worker::Supervisor`] for why the one background thread in this
//! workspace exists), polls with [`libc::poll`], services at most one
//! event per descriptor, then re-runs framers so that newly freed capacity
//! is used immediately rather than waiting for the next iteration.

use echidna_error::EchidnaError;
use echidna_framer::{Diagnostic, Framer, FramingFatal, Role, SinkOutcome};
use echidna_ring::RingBuffer;
use echidna_worker::{CommandSpec, Supervisor, WorkerHandle};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Buffer-size defaults, kept as build-time constants per the non-goal on a
/// configuration store (no CLI flag tunes these).
pub const DEFAULT_INLET_CAPACITY: usize = 262_144;
pub const DEFAULT_OUTLET_CAPACITY: usize = 262_144;
pub const DEFAULT_WORKER_IN_CAPACITY: usize = 65_536;
pub const DEFAULT_WORKER_OUT_CAPACITY: usize = 65_536;

/// The bounded wait used only when nothing is watchable but at least one
/// worker has not yet been reaped. Bounds shutdown latency to this value.
const BOUNDED_WAIT_MS: i32 = 50;

/// Immutable, CLI-derived configuration for one router run.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub processes: usize,
    pub command: CommandSpec,
    pub inlet_capacity: usize,
    pub outlet_capacity: usize,
    pub worker_in_capacity: usize,
    pub worker_out_capacity: usize,
}

impl RouterConfig {
    pub fn new(processes: usize, command: CommandSpec) -> Self {
        Self {
            processes,
            command,
            inlet_capacity: DEFAULT_INLET_CAPACITY,
            outlet_capacity: DEFAULT_OUTLET_CAPACITY,
            worker_in_capacity: DEFAULT_WORKER_IN_CAPACITY,
            worker_out_capacity: DEFAULT_WORKER_OUT_CAPACITY,
        }
    }
}

/// Which descriptor a `pollfd` slot in this iteration's readiness set
/// corresponds to, so revents can be routed back to the right handler.
enum FdTag {
    Stdin,
    Stdout,
    WorkerStdout(usize),
    WorkerStdin(usize),
}

/// Owns the inlet/outlet buffers and the inlet framer for one router run.
/// Worker-side state lives in each [`WorkerHandle`].
struct Session {
    stdin_closed: bool,
    inlet: RingBuffer,
    outlet: RingBuffer,
    inlet_framer: Framer,
    rr_next: usize,
    diagnostics: Vec<Diagnostic>,
    bytes_routed: Vec<u64>,
}

impl Session {
    fn new(config: &RouterConfig, n_workers: usize) -> Self {
        Self {
            stdin_closed: false,
            inlet: RingBuffer::new(config.inlet_capacity),
            outlet: RingBuffer::new(config.outlet_capacity),
            inlet_framer: Framer::new(Role::Inlet),
            rr_next: 0,
            diagnostics: Vec::new(),
            bytes_routed: vec![0; n_workers],
        }
    }
}

/// Runs one full router session to completion: spawns the workers, drives
/// the event loop, and returns once every worker has been reaped and
/// stdout has nothing left to drain. Takes over fd 0 and fd 1 for the
/// duration of the call.
pub fn run(config: RouterConfig) -> Result<(), EchidnaError> {
    // SAFETY: fd 0 and fd 1 are the process's own standard streams, valid
    // for the life of the process; wrapping them in a `File` does not
    // create a second owner since nothing else in this binary touches them.
    let mut stdin = unsafe { File::from_raw_fd(0) };
    let mut stdout = unsafe { File::from_raw_fd(1) };
    echidna_worker::make_nonblocking(0).map_err(|source| EchidnaError::IoFatal { fd_label: "stdin", source })?;
    echidna_worker::make_nonblocking(1).map_err(|source| EchidnaError::IoFatal { fd_label: "stdout", source })?;
    run_with_streams(config, &mut stdin, &mut stdout)
}

/// Same as [`run`] but reads from and writes to the given streams instead
/// of assuming fd 0/1 are the process's own — the seam integration tests
/// use to drive a router session against real child-process pipes without
/// hijacking the test harness's own standard streams. Callers are
/// responsible for putting `stdin`/`stdout` into non-blocking mode first.
pub fn run_with_streams<R, W>(config: RouterConfig, stdin: &mut R, stdout: &mut W) -> Result<(), EchidnaError>
where
    R: Read + AsRawFd,
    W: Write + AsRawFd,
{
    let (mut workers, supervisor) =
        echidna_worker::spawn(config.processes, &config.command, config.worker_out_capacity, config.worker_in_capacity)?;

    let mut session = Session::new(&config, workers.len());

    let result = drive(stdin, stdout, &mut session, &mut workers, &supervisor);

    // Closing every worker's stdin here, regardless of how `drive` returned,
    // guarantees children still blocked reading their own input see EOF and
    // can exit before `supervisor` is dropped below. On a completed
    // termination sequence this is a no-op (every stdin is already closed);
    // on an early fatal return (e.g. `UnknownFormat` on the first byte) it is
    // what makes exit 1 actually happen instead of hanging in
    // `Supervisor::drop`'s `join`.
    Supervisor::shutdown(&mut workers);

    for (id, bytes) in session.bytes_routed.iter().enumerate() {
        debug!(worker_id = id, bytes_routed = bytes, "worker summary");
    }
    let total: u64 = session.bytes_routed.iter().sum();
    info!(total_bytes_routed = total, "router session complete");
    result
}

fn drive<R, W>(stdin: &mut R, stdout: &mut W, session: &mut Session, workers: &mut [WorkerHandle], supervisor: &Supervisor) -> Result<(), EchidnaError>
where
    R: Read + AsRawFd,
    W: Write + AsRawFd,
{
    loop {
        let exits = supervisor.poll_exits();
        if !exits.is_empty() {
            Supervisor::apply_exits(&exits, workers);
        }

        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut tags: Vec<FdTag> = Vec::new();

        if !session.stdin_closed && !session.inlet.is_full() {
            fds.push(pollfd_for(stdin.as_raw_fd(), libc::POLLIN));
            tags.push(FdTag::Stdin);
        }
        if !session.outlet.is_empty() {
            fds.push(pollfd_for(stdout.as_raw_fd(), libc::POLLOUT));
            tags.push(FdTag::Stdout);
        }
        for (i, w) in workers.iter().enumerate() {
            let liveness = w.liveness();
            if liveness.stdout_alive && !w.inbuf.is_full() {
                fds.push(pollfd_for(w.stdout_fd(), libc::POLLIN));
                tags.push(FdTag::WorkerStdout(i));
            }
            if liveness.stdin_alive && !w.outbuf.is_empty() {
                if let Some(fd) = w.stdin_fd() {
                    fds.push(pollfd_for(fd, libc::POLLOUT));
                    tags.push(FdTag::WorkerStdin(i));
                }
            }
        }

        #[cfg(feature = "trace-loop")]
        debug!(watched = fds.len(), "readiness iteration");

        if fds.is_empty() {
            if !workers.iter().any(|w| !w.is_reaped()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(BOUNDED_WAIT_MS as u64));
            continue;
        }

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, BOUNDED_WAIT_MS) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(EchidnaError::IoFatal { fd_label: "poll", source: err });
        }

        for (pfd, tag) in fds.iter().zip(tags.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            match tag {
                FdTag::Stdin => service_stdin(stdin, session, workers)?,
                FdTag::Stdout => service_stdout(stdout, session, workers)?,
                FdTag::WorkerStdout(i) => service_worker_stdout(*i, session, workers)?,
                FdTag::WorkerStdin(i) => service_worker_stdin(*i, session, workers)?,
            }
        }

        for w in workers.iter_mut() {
            let liveness = w.liveness();
            if liveness.stdin_alive && session.stdin_closed && w.outbuf.is_empty() {
                debug!(worker_id = w.id, "stdin drained, signalling worker EOF");
                w.close_stdin();
            }
        }
    }

    Ok(())
}

fn pollfd_for(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

fn service_stdin<R: Read>(stdin: &mut R, session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    let buf = session.inlet.contiguous_vacant();
    if !buf.is_empty() {
        match stdin.read(buf) {
            Ok(0) => {
                info!("stdin closed");
                session.stdin_closed = true;
            }
            Ok(n) => session.inlet.commit_written(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(EchidnaError::IoFatal { fd_label: "stdin", source: e }),
        }
    }
    run_inlet_framer(session, workers)
}

fn service_stdout<W: Write>(stdout: &mut W, session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    let buf = session.outlet.contiguous_filled();
    if !buf.is_empty() {
        match stdout.write(buf) {
            Ok(n) => session.outlet.commit_consumed(n.max(0)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(EchidnaError::IoFatal { fd_label: "stdout", source: e }),
        }
    }
    // Room just opened up in the outlet; let every worker with pending
    // inbound bytes try to deliver into it before the next wait.
    for i in 0..workers.len() {
        run_worker_framer(i, session, workers)?;
    }
    Ok(())
}

fn service_worker_stdout(i: usize, session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    let w = &mut workers[i];
    let buf = w.inbuf.contiguous_vacant();
    if !buf.is_empty() {
        match w.stdout_mut().read(buf) {
            Ok(0) => {
                info!(worker_id = w.id, "worker stdout closed");
                w.mark_stdout_eof();
            }
            Ok(n) => w.inbuf.commit_written(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(EchidnaError::IoFatal { fd_label: "worker stdout", source: e }),
        }
    }
    run_worker_framer(i, session, workers)
}

fn service_worker_stdin(i: usize, session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    {
        let w = &mut workers[i];
        let buf = w.outbuf.contiguous_filled();
        if !buf.is_empty() {
            if let Some(stdin) = w.stdin_mut() {
                match stdin.write(buf) {
                    Ok(n) => {
                        w.outbuf.commit_consumed(n.max(0));
                        session.bytes_routed[i] += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(EchidnaError::IoFatal { fd_label: "worker stdin", source: e }),
                }
            }
        }
    }
    // Freed outbound capacity may let the inlet framer dispatch more.
    run_inlet_framer(session, workers)
}

fn run_inlet_framer(session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    let rr_next = &mut session.rr_next;
    let diagnostics = &mut session.diagnostics;
    let result = session.inlet_framer.run(&mut session.inlet, diagnostics, |src, len| dispatch(workers, rr_next, src, len));
    drain_diagnostics(&mut session.diagnostics);
    match result {
        Ok(()) => Ok(()),
        Err(FramingFatal::UnknownFormat) => Err(EchidnaError::UnknownFormat { source_label: "stdin" }),
        Err(FramingFatal::FastaInletUnsupported) => Err(EchidnaError::FastaInletUnsupported { source_label: "stdin" }),
    }
}

fn run_worker_framer(i: usize, session: &mut Session, workers: &mut [WorkerHandle]) -> Result<(), EchidnaError> {
    let w = &mut workers[i];
    let mut diagnostics = Vec::new();
    let outlet = &mut session.outlet;
    let result = w.framer.run(&mut w.inbuf, &mut diagnostics, |src, len| match outlet.transfer(src, len) {
        Ok(()) => SinkOutcome::Delivered,
        Err(_) => SinkOutcome::NoSpace,
    });
    drain_diagnostics(&mut diagnostics);
    match result {
        Ok(()) => Ok(()),
        Err(FramingFatal::UnknownFormat) => Err(EchidnaError::UnknownFormat { source_label: "worker stdout" }),
        Err(FramingFatal::FastaInletUnsupported) => {
            unreachable!("worker-role framers never reject FASTA")
        }
    }
}

/// Round-robin dispatch: probe workers starting at `rr_next`, skipping any
/// whose stdin we've already closed, and advance the cursor only on a
/// successful transfer.
fn dispatch(workers: &mut [WorkerHandle], rr_next: &mut usize, src: &mut RingBuffer, len: usize) -> SinkOutcome {
    let n = workers.len();
    if n == 0 {
        return SinkOutcome::NoSpace;
    }
    for step in 0..n {
        let idx = (*rr_next + step) % n;
        let w = &mut workers[idx];
        if !w.liveness().stdin_alive {
            continue;
        }
        if w.outbuf.transfer(src, len).is_ok() {
            *rr_next = (idx + 1) % n;
            return SinkOutcome::Delivered;
        }
    }
    SinkOutcome::NoSpace
}

fn drain_diagnostics(diagnostics: &mut Vec<Diagnostic>) {
    for d in diagnostics.drain(..) {
        warn!("{d}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_skips_closed_workers_and_advances_cursor() {
        let (mut workers, _sup) = echidna_worker::spawn(3, &CommandSpec::Exec(vec!["cat".into()]), 256, 256).unwrap();
        workers[1].close_stdin();
        let mut src = RingBuffer::new(64);
        src.put(b"hello").unwrap();
        let mut rr_next = 1;

        let outcome = dispatch(&mut workers, &mut rr_next, &mut src, 5);

        assert_eq!(outcome, SinkOutcome::Delivered);
        // worker 1 is closed, so worker 2 receives it
        assert_eq!(workers[2].outbuf.occupancy(), 5);
        assert_eq!(rr_next, 0);
    }

    #[test]
    fn dispatch_reports_no_space_when_every_worker_is_full() {
        let (mut workers, _sup) = echidna_worker::spawn(1, &CommandSpec::Exec(vec!["cat".into()]), 8, 256).unwrap();
        let mut src = RingBuffer::new(64);
        src.put(b"0123456").unwrap(); // fills the 7-byte usable capacity of an 8-byte outbuf
        let mut rr_next = 0;
        workers[0].outbuf.put(b"xxxxxxx").unwrap();

        let outcome = dispatch(&mut workers, &mut rr_next, &mut src, 7);
        assert_eq!(outcome, SinkOutcome::NoSpace);
    }
}
