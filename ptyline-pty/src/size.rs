//! Window size for PTY

use std::os::fd::{AsRawFd, BorrowedFd};

/// Window size in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of rows (characters)
    pub rows: u16,
    /// Number of columns (characters)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a window size with pixel dimensions
    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    /// Push this size to a terminal with `TIOCSWINSZ`.
    ///
    /// On a master descriptor the kernel forwards SIGWINCH to the
    /// foreground process group of the session on the other side.
    pub fn apply(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        let ws = self.to_winsize();
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
        if result == -1 {
            Err(nix::Error::last())
        } else {
            Ok(())
        }
    }

    /// Read the size currently recorded by the kernel for a terminal
    pub fn query(fd: BorrowedFd<'_>) -> nix::Result<Self> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
        if result == -1 {
            Err(nix::Error::last())
        } else {
            Ok(Self::from(ws))
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_default() {
        let size = WindowSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn test_window_size_with_pixels() {
        let size = WindowSize::with_pixels(24, 80, 800, 600);
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert_eq!(size.pixel_width, 800);
        assert_eq!(size.pixel_height, 600);
    }

    #[test]
    fn test_to_winsize() {
        let ws = WindowSize::new(40, 100).to_winsize();
        assert_eq!(ws.ws_row, 40);
        assert_eq!(ws.ws_col, 100);
        assert_eq!(WindowSize::from(ws), WindowSize::new(40, 100));
    }

    #[test]
    fn test_apply_and_query_on_pty() {
        let pair = nix::pty::openpty(None, None).unwrap();
        use std::os::fd::AsFd;

        WindowSize::new(33, 111).apply(pair.master.as_fd()).unwrap();
        let seen = WindowSize::query(pair.slave.as_fd()).unwrap();
        assert_eq!((seen.rows, seen.cols), (33, 111));
    }
}
