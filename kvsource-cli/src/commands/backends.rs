use kvsource::BackendKind;

/// Print every supported backend kind, marking the default.
pub fn run_backends() {
    for kind in BackendKind::ALL {
        if kind == BackendKind::DEFAULT {
            println!("{} (default)", kind);
        } else {
            println!("{}", kind);
        }
    }
}
