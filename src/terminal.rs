//! Terminal echo control for the passphrase prompt.
//!
//! The saved state lives in a process-global slot so the signal handler can
//! restore the terminal even when the prompt is interrupted mid-read. The
//! prompt runs synchronously before the tunnel comes up, so the slot has a
//! single writer.

use std::io::{self, BufRead, Write};

#[cfg(unix)]
use std::sync::Mutex;

#[cfg(unix)]
static SAVED_STATE: Mutex<Option<libc::termios>> = Mutex::new(None);

/// Prompt on the controlling terminal with echo disabled and read one line.
pub fn read_passphrase(prompt: &str) -> io::Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;

    #[cfg(unix)]
    let echo_disabled = disable_echo();
    #[cfg(not(unix))]
    let echo_disabled = false;

    let mut line = String::new();
    let read_result = io::stdin().lock().read_line(&mut line);

    if echo_disabled {
        restore();
    }
    println!();

    read_result?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(unix)]
fn disable_echo() -> bool {
    let fd = libc::STDIN_FILENO;

    let mut term = unsafe { std::mem::zeroed::<libc::termios>() };
    if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
        // Not a terminal (piped stdin); nothing to save or restore.
        return false;
    }

    *SAVED_STATE.lock().unwrap() = Some(term);

    let mut silent = term;
    silent.c_lflag &= !libc::ECHO;
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &silent) == 0 }
}

/// Restore the saved terminal state, if any. Idempotent; called on the
/// normal prompt exit path and from the signal handler.
pub fn restore() {
    #[cfg(unix)]
    {
        let saved = SAVED_STATE.lock().unwrap().take();
        if let Some(term) = saved {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term);
            }
        }
    }
}
