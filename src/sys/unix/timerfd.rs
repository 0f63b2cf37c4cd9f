use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use crate::time::TimePoint;

/// Kernel timer the run loop programs to the earliest pending deadline.
///
/// The timer is armed in absolute mode against `CLOCK_MONOTONIC` so it agrees
/// with [`TimePoint::now`]. It never repeats; the run loop reprograms it as
/// the timer heap changes.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: std::fs::File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        let fd = unsafe { std::fs::File::from_raw_fd(fd) };
        Ok(TimerFd { fd })
    }

    /// Arm the timer to fire once at the absolute `deadline`.
    pub(crate) fn set(&self, deadline: TimePoint) -> io::Result<()> {
        self.settime(libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: deadline.seconds() as libc::time_t,
                tv_nsec: deadline.subsec_nanos() as libc::c_long,
            },
        })
    }

    /// Disarm the timer. A zero `it_value` tells the kernel not to fire.
    pub(crate) fn disarm(&self) -> io::Result<()> {
        self.settime(libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        })
    }

    fn settime(&self, mut spec: libc::itimerspec) -> io::Result<()> {
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            libc::TFD_TIMER_ABSTIME,
            &mut spec,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    /// Clear the expiration count after the fd signalled readable.
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            // Disarmed (or raced with a reprogram) before we got to read it.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.drain(),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TimerFd;
    use crate::time::TimePoint;

    #[test]
    fn arm_and_disarm() {
        let timer = TimerFd::new().expect("unable to create timerfd");
        timer
            .set(TimePoint::now() + Duration::from_secs(10))
            .expect("unable to arm");
        timer.disarm().expect("unable to disarm");
        // Nothing fired, so the drain sees an empty counter.
        timer.drain().expect("unable to drain");
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let timer = TimerFd::new().expect("unable to create timerfd");
        timer.set(TimePoint::now()).expect("unable to arm");
        std::thread::sleep(Duration::from_millis(10));
        timer.drain().expect("unable to drain");
    }
}
