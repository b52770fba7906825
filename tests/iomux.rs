// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end exercises of the stdio multiplexer over real pipes and unix
//! socket pairs, driving the reactor manually with zero-timeout passes.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::gridkernel::{
    ensure_eq,
    iomux::{
        FrameHeader,
        FrameKind,
        InitMessage,
        IoMuxOptions,
        SharedIoMux,
        TaskStdio,
        HEADER_SIZE,
    },
    runtime::limits,
};
use ::std::os::unix::io::RawFd;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on reactor passes per test; every scenario settles far below.
const MAX_PASSES: usize = 10_000;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn ignore_sigpipe() {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds: [RawFd; 2] = [-1; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds: [RawFd; 2] = [-1; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

fn set_nonblocking(fd: RawFd) {
    let flags: i32 = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags >= 0);
    assert!(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } >= 0);
}

fn write_all(fd: RawFd, bytes: &[u8]) {
    let mut written: usize = 0;
    while written < bytes.len() {
        let n: isize = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        assert!(n > 0, "write failed");
        written += n as usize;
    }
}

/// Drains whatever is currently readable from a non-blocking fd.
fn read_available(fd: RawFd, sink: &mut Vec<u8>) {
    let mut chunk: [u8; 4096] = [0; 4096];
    loop {
        let n: isize = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n <= 0 {
            return;
        }
        sink.extend_from_slice(&chunk[..n as usize]);
    }
}

/// Splits complete frames off the front of a raw byte accumulator.
fn drain_frames(raw: &mut Vec<u8>) -> Vec<(FrameHeader, Vec<u8>)> {
    let mut frames: Vec<(FrameHeader, Vec<u8>)> = Vec::new();
    loop {
        if raw.len() < HEADER_SIZE {
            return frames;
        }
        let header: FrameHeader = FrameHeader::parse(raw).expect("valid frame header");
        let total: usize = HEADER_SIZE + header.length as usize;
        if raw.len() < total {
            return frames;
        }
        let payload: Vec<u8> = raw[HEADER_SIZE..total].to_vec();
        raw.drain(..total);
        frames.push((header, payload));
    }
}

fn stdin_frame(kind: FrameKind, gtaskid: u16, payload: &[u8]) -> Vec<u8> {
    let header: FrameHeader = FrameHeader::new(kind, gtaskid, 0, payload.len() as u32);
    let mut bytes: Vec<u8> = vec![0; HEADER_SIZE];
    header.serialize(&mut bytes);
    bytes.extend_from_slice(payload);
    bytes
}

fn read_init(remote: RawFd) -> InitMessage {
    let mut raw: Vec<u8> = Vec::new();
    for _ in 0..MAX_PASSES {
        read_available(remote, &mut raw);
        if raw.len() >= InitMessage::SIZE {
            break;
        }
    }
    let init: InitMessage = InitMessage::parse(&raw).expect("valid init message");
    assert_eq!(raw.len(), InitMessage::SIZE, "nothing follows the init message yet");
    init
}

fn unbuffered_options(max_msg_cache: usize) -> IoMuxOptions {
    IoMuxOptions {
        buffered_stdio: false,
        max_msg_cache,
        incoming_buffers: 4,
        outgoing_buffers: 16,
    }
}

//======================================================================================================================
// Integration Tests
//======================================================================================================================

/// Two tasks each write ten full frames; one client attached from the start
/// receives all twenty in per-task order, then the EOF markers, and every
/// buffer finds its way back to the pool.
#[test]
fn two_task_fan_in() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(0))?;

    let mut task_stdout: Vec<RawFd> = Vec::new();
    for gtaskid in 0..2u16 {
        let (read_end, write_end) = pipe();
        mux.add_task(TaskStdio {
            gtaskid,
            ltaskid: gtaskid,
            stdin: None,
            stdout: Some(read_end),
            stderr: None,
        })?;
        task_stdout.push(write_end);
    }

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    let init: InitMessage = read_init(remote);
    ensure_eq!(init.stdout_objs, 2);
    ensure_eq!(init.stderr_objs, 0);

    // Each task emits 10 payload-sized writes tagged (frame, task).
    for frame in 0..10u8 {
        for (task, write_end) in task_stdout.iter().enumerate() {
            let marker: u8 = frame * 2 + task as u8;
            write_all(*write_end, &vec![marker; limits::MAX_PAYLOAD]);
        }
    }
    for write_end in &task_stdout {
        unsafe { libc::close(*write_end) };
    }

    let mut raw: Vec<u8> = Vec::new();
    let mut frames: Vec<(FrameHeader, Vec<u8>)> = Vec::new();
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        read_available(remote, &mut raw);
        frames.extend(drain_frames(&mut raw));
        let eofs: usize = frames.iter().filter(|(h, _)| h.length == 0).count();
        if frames.len() == 22 && eofs == 2 {
            break;
        }
    }

    // Per-task delivery order matches emission order.
    for task in 0..2u16 {
        let markers: Vec<u8> = frames
            .iter()
            .filter(|(h, _)| h.gtaskid == task && h.length > 0)
            .map(|(_, payload)| {
                assert_eq!(payload.len(), limits::MAX_PAYLOAD);
                assert!(payload.iter().all(|b: &u8| *b == payload[0]));
                payload[0]
            })
            .collect();
        let expected: Vec<u8> = (0..10u8).map(|frame: u8| frame * 2 + task as u8).collect();
        ensure_eq!(markers, expected);
    }

    // Queues are empty and every buffer is back in its pool.
    ensure_eq!(mux.cache().len(), 0);
    ensure_eq!(mux.pool().outgoing().available(), 16);
    ensure_eq!(mux.pool().incoming().available(), 4);
    Ok(())
}

/// Output produced before any client attaches survives in the bounded replay
/// cache; a late client first receives the newest cached frames in order,
/// then live output.
#[test]
fn late_attach_replays_cache() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(5))?;

    let (read_end, write_end) = pipe();
    mux.add_task(TaskStdio {
        gtaskid: 0,
        ltaskid: 0,
        stdin: None,
        stdout: Some(read_end),
        stderr: None,
    })?;

    // Ten frames with nobody listening; the cache keeps the newest five.
    for frame in 0..10u8 {
        write_all(write_end, &vec![frame; limits::MAX_PAYLOAD]);
    }
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        if mux.cache().len() == 5 && mux.pool().outgoing().available() == 16 - 5 {
            break;
        }
    }
    ensure_eq!(mux.cache().len(), 5);

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    read_init(remote);

    // Two live frames after the attach.
    write_all(write_end, &vec![10u8; limits::MAX_PAYLOAD]);
    write_all(write_end, &vec![11u8; limits::MAX_PAYLOAD]);

    let mut raw: Vec<u8> = Vec::new();
    let mut frames: Vec<(FrameHeader, Vec<u8>)> = Vec::new();
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        read_available(remote, &mut raw);
        frames.extend(drain_frames(&mut raw));
        if frames.len() == 7 {
            break;
        }
    }

    let markers: Vec<u8> = frames.iter().map(|(_, payload)| payload[0]).collect();
    ensure_eq!(markers, vec![5, 6, 7, 8, 9, 10, 11]);
    unsafe { libc::close(write_end) };
    Ok(())
}

/// A client that disappears mid-stream gets torn down on `EPIPE` while the
/// task side keeps flowing into the cache, and no buffer leaks.
#[test]
fn client_gone_mid_stream() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(5))?;

    let (read_end, write_end) = pipe();
    mux.add_task(TaskStdio {
        gtaskid: 0,
        ltaskid: 0,
        stdin: None,
        stdout: Some(read_end),
        stderr: None,
    })?;

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    read_init(remote);

    // Deliver three frames normally.
    for frame in 0..3u8 {
        write_all(write_end, &vec![frame; limits::MAX_PAYLOAD]);
    }
    let mut raw: Vec<u8> = Vec::new();
    let mut frames: Vec<(FrameHeader, Vec<u8>)> = Vec::new();
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        read_available(remote, &mut raw);
        frames.extend(drain_frames(&mut raw));
        if frames.len() == 3 {
            break;
        }
    }
    ensure_eq!(frames.len(), 3);

    // The client goes away; the server keeps reading task output.
    unsafe { libc::close(remote) };
    for frame in 3..10u8 {
        write_all(write_end, &vec![frame; limits::MAX_PAYLOAD]);
    }
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        if mux.cache().len() == 5 && mux.pool().outgoing().available() + mux.cache().len() == 16 {
            break;
        }
    }

    // Only the cache still holds buffers; the dead client released its queue.
    ensure_eq!(mux.cache().len(), 5);
    ensure_eq!(mux.pool().outgoing().available(), 16 - 5);
    unsafe { libc::close(write_end) };
    Ok(())
}

/// One `AllStdin` frame lands on every task's stdin, and a zero-length frame
/// closes the pipes.
#[test]
fn allstdin_fans_out_to_every_task() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(0))?;

    let mut task_stdin: Vec<RawFd> = Vec::new();
    for gtaskid in 0..4u16 {
        let (read_end, write_end) = pipe();
        set_nonblocking(read_end);
        mux.add_task(TaskStdio {
            gtaskid,
            ltaskid: gtaskid,
            stdin: Some(write_end),
            stdout: None,
            stderr: None,
        })?;
        task_stdin.push(read_end);
    }

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    read_init(remote);

    let payload: Vec<u8> = (0..1024).map(|_| ::rand::random::<u8>()).collect();
    write_all(remote, &stdin_frame(FrameKind::AllStdin, 0, &payload));

    let mut delivered: Vec<Vec<u8>> = vec![Vec::new(); 4];
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        for (task, read_end) in task_stdin.iter().enumerate() {
            read_available(*read_end, &mut delivered[task]);
        }
        if delivered.iter().all(|bytes: &Vec<u8>| bytes.len() == payload.len()) {
            break;
        }
    }
    for bytes in &delivered {
        ensure_eq!(bytes, &payload);
    }

    // The shared buffer went back to its pool after the last drain.
    ensure_eq!(mux.pool().incoming().available(), 4);

    // A zero-length frame is stdin EOF for every task.
    write_all(remote, &stdin_frame(FrameKind::AllStdin, 0, &[]));
    let mut closed: usize = 0;
    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        closed = task_stdin
            .iter()
            .filter(|read_end: &&RawFd| {
                let mut probe: [u8; 1] = [0];
                unsafe { libc::read(**read_end, probe.as_mut_ptr() as *mut libc::c_void, 1) == 0 }
            })
            .count();
        if closed == 4 {
            break;
        }
    }
    ensure_eq!(closed, 4);

    for read_end in &task_stdin {
        unsafe { libc::close(*read_end) };
    }
    Ok(())
}

/// Teardown flushes what the clients are owed, sends the EOF markers, and
/// unregisters everything, after which `run` falls out of its loop.
#[test]
fn teardown_flushes_and_unregisters() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(0))?;

    let (read_end, write_end) = pipe();
    let (stdin_read, stdin_write) = pipe();
    mux.add_task(TaskStdio {
        gtaskid: 0,
        ltaskid: 0,
        stdin: Some(stdin_write),
        stdout: Some(read_end),
        stderr: None,
    })?;

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    read_init(remote);

    write_all(write_end, &vec![0x42; limits::MAX_PAYLOAD]);
    unsafe { libc::close(write_end) };

    mux.close_all();
    mux.run()?;

    // The pending frame and the stream's EOF marker both made it out.
    let mut raw: Vec<u8> = Vec::new();
    read_available(remote, &mut raw);
    let frames: Vec<(FrameHeader, Vec<u8>)> = drain_frames(&mut raw);
    ensure_eq!(frames.len(), 2);
    ensure_eq!(frames[0].1.len(), limits::MAX_PAYLOAD);
    ensure_eq!(frames[1].0.length, 0);

    // The task's stdin pipe was closed by the teardown.
    let mut probe: [u8; 1] = [0];
    ensure_eq!(
        unsafe { libc::read(stdin_read, probe.as_mut_ptr() as *mut libc::c_void, 1) },
        0
    );

    unsafe { libc::close(stdin_read) };
    unsafe { libc::close(remote) };
    Ok(())
}

/// A frame announcing an oversized payload is a protocol violation: the
/// offending client is torn down, the process carries on.
#[test]
fn oversized_frame_tears_the_client_down() -> Result<()> {
    ignore_sigpipe();
    let mut mux: SharedIoMux = SharedIoMux::new(0, [0; limits::CRED_SIGLEN], unbuffered_options(0))?;

    let (local, remote) = socketpair();
    mux.attach_client(local)?;
    set_nonblocking(remote);
    read_init(remote);

    let header: FrameHeader = FrameHeader::new(FrameKind::Stdin, 0, 0, limits::MAX_PAYLOAD as u32);
    let mut bytes: Vec<u8> = vec![0; HEADER_SIZE];
    header.serialize(&mut bytes);
    // Corrupt the length field beyond the protocol maximum.
    bytes[6..10].copy_from_slice(&(limits::MAX_PAYLOAD as u32 + 1).to_be_bytes());
    write_all(remote, &bytes);

    for _ in 0..MAX_PASSES {
        mux.poll_once(0)?;
        let mut probe: [u8; 1] = [0];
        let n: isize = unsafe { libc::read(remote, probe.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 0 {
            // Server closed its end of the connection.
            break;
        }
    }
    // The half-read message buffer went back to its pool.
    ensure_eq!(mux.pool().incoming().available(), 4);
    unsafe { libc::close(remote) };
    Ok(())
}
