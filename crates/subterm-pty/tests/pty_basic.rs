#[cfg(unix)]
#[test]
fn allocate_and_resize_pty() {
    use subterm_pty::{Pty, WindowSize};
    let pty = Pty::new().expect("allocate pty");
    // Basic resize should succeed
    pty.resize(WindowSize::new(30, 100)).expect("resize");
    assert_eq!(pty.window_size().expect("window size"), WindowSize::new(30, 100));
    // Slave path should point into the pts namespace
    assert!(pty.slave_path().to_string_lossy().starts_with("/dev/"));
}
