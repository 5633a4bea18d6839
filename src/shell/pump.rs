use std::os::fd::{AsRawFd, OwnedFd};

use chrono::Utc;
use tokio::io::unix::AsyncFd;

use crate::shell::logstore::LogAppender;
use crate::shell::shell_event;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Transfer the child's merged stdout+stderr into the log until EOF.
///
/// Runs as its own task so a blocked pipe never stalls request handling;
/// read errors other than EOF are absorbed here (the supervisor treats the
/// pump ending like EOF and proceeds to reap). Owns the read end of the pipe
/// and closes it on exit.
pub(crate) async fn run(pipe: OwnedFd, mut appender: LogAppender) {
    if let Err(e) = pump_lines(pipe, &mut appender).await {
        shell_event("pump", format!("outcome=error err={e:#}"));
    }
}

async fn pump_lines(pipe: OwnedFd, appender: &mut LogAppender) -> anyhow::Result<()> {
    set_nonblocking(&pipe)?;
    let afd = AsyncFd::new(pipe)?;

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = read_chunk(&afd, &mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            append_line(appender, &raw).await?;
        }
    }
    if !pending.is_empty() {
        // EOF terminates a final line that never saw its newline.
        let raw = std::mem::take(&mut pending);
        append_line(appender, &raw).await?;
    }
    Ok(())
}

async fn append_line(appender: &mut LogAppender, raw: &[u8]) -> std::io::Result<()> {
    // Invalid UTF-8 is replaced, never fatal; trailing CR/LF is stripped.
    let mut text = String::from_utf8_lossy(raw).into_owned();
    while text.ends_with('\n') || text.ends_with('\r') {
        text.pop();
    }
    appender.append(&text, Utc::now()).await
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    // SAFETY: fd is a valid open descriptor for the life of this call.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

async fn read_chunk(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> anyhow::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: fd is a valid open pipe fd; buf is a valid writable slice.
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(anyhow::anyhow!("read pipe: {e}")),
            Err(_would_block) => continue,
        }
    }
}
