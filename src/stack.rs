//! Discovery of the stack base, the far end of the stack from the live top.
//!
//! The root scanner walks the stack from the current stack pointer up to this
//! address. A wrong value is never recoverable: too low and roots are missed,
//! too high and the scanner reads memory that is not the stack. Failure to
//! read it is therefore an error rather than a guess.

use crate::error::{Error, Result};

/// Index of `startstack` among the fields that follow the command name in
/// `/proc/self/stat`. It is field 28 overall and the first field after the
/// command name is field 3.
const START_STACK_FIELD: usize = 28 - 3;

/// Returns the base of the calling thread's stack.
///
/// On the main thread this is the `startstack` field of `/proc/self/stat`.
/// That file only describes the main thread, so any other thread asks the
/// threading library for the bounds of its own stack instead.
#[cfg(target_os = "linux")]
pub(crate) fn discover() -> Result<usize> {
    let main_thread = unsafe { libc::getpid() == libc::gettid() };

    let base = if main_thread {
        let stat = std::fs::read_to_string("/proc/self/stat").map_err(|err| {
            Error::StackBaseUnavailable {
                reason: format!("cannot read /proc/self/stat: {err}"),
            }
        })?;

        parse_start_stack(&stat)?
    } else {
        thread_stack_base()?
    };

    log::debug!(
        "Stack base discovered at {:#x} (main thread: {})",
        base,
        main_thread
    );

    Ok(base)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn discover() -> Result<usize> {
    Err(Error::StackBaseUnavailable {
        reason: "process stack metadata is only read on linux".to_string(),
    })
}

/// Extracts `startstack` from the content of `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
pub(crate) fn parse_start_stack(stat: &str) -> Result<usize> {
    let unavailable = |reason: &str| Error::StackBaseUnavailable {
        reason: reason.to_string(),
    };

    let (_, fields) = stat
        .rsplit_once(')')
        .ok_or_else(|| unavailable("malformed stat line: no command name"))?;

    let field = fields
        .split_whitespace()
        .nth(START_STACK_FIELD)
        .ok_or_else(|| unavailable("stat line has no startstack field"))?;

    let base = field
        .parse::<usize>()
        .map_err(|_| unavailable("startstack is not a number"))?;

    if base == 0 {
        return Err(unavailable("startstack is zero"));
    }

    Ok(base)
}

#[cfg(target_os = "linux")]
fn thread_stack_base() -> Result<usize> {
    use std::{mem, ptr};

    let failed = |call: &str, code: i32| Error::StackBaseUnavailable {
        reason: format!("{call} failed with code {code}"),
    };

    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();

        let code = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if code != 0 {
            return Err(failed("pthread_getattr_np", code));
        }

        let mut addr: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let code = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);

        if code != 0 {
            return Err(failed("pthread_attr_getstack", code));
        }

        // The attribute reports the lowest address; stacks grow down from the top.
        Ok(addr as usize + size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A trimmed down but well formed stat line with startstack = 140737488347136.
    fn stat_line(comm: &str) -> String {
        let mut fields = vec!["S".to_string()];
        // Fields 4 to 27
        fields.extend((4..28).map(|i| i.to_string()));
        fields.push("140737488347136".to_string());
        fields.extend(["0", "0", "0"].map(String::from));

        format!("4242 ({comm}) {}", fields.join(" "))
    }

    #[test]
    fn parses_start_stack() {
        assert_eq!(140737488347136, parse_start_stack(&stat_line("gc")).unwrap());
    }

    #[test]
    fn command_name_with_spaces_and_parens() {
        let stat = stat_line("my (odd) name");
        assert_eq!(140737488347136, parse_start_stack(&stat).unwrap());
    }

    #[test]
    fn truncated_line_is_rejected() {
        assert!(matches!(
            parse_start_stack("4242 (gc) S 1 2 3"),
            Err(Error::StackBaseUnavailable { .. })
        ));
        assert!(parse_start_stack("garbage").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn base_is_above_live_locals() {
        let local = 0usize;
        let here = &local as *const usize as usize;

        let base = discover().unwrap();
        assert!(base > here);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn spawned_threads_get_their_own_base() {
        let outer = discover().unwrap();

        let inner = std::thread::spawn(|| {
            let local = 0usize;
            let here = &local as *const usize as usize;
            let base = discover().unwrap();
            assert!(base > here);
            base
        })
        .join()
        .unwrap();

        assert_ne!(outer, inner);
    }
}
