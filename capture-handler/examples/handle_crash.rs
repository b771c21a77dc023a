use capture_handler::{
    dispatcher, registrar, AltStack, DispatchState, OsDispositions, ReportTarget, SymbolTable,
    Symbolizer, MONITORED_SIGNALS,
};

fn main() {
    let mut dispositions = OsDispositions::claim().unwrap();
    let alt_stack = AltStack::allocate(0).unwrap();

    let symbolizer = match SymbolTable::from_current_exe() {
        Ok(table) => {
            println!("loaded {} symbols for {}", table.len(), table.image());
            Symbolizer::Table(table)
        }
        Err(e) => {
            println!("continuing without symbols: {}", e);
            Symbolizer::Disabled
        }
    };

    let state: &'static DispatchState = Box::leak(Box::new(DispatchState {
        target: ReportTarget::Fd(libc::STDERR_FILENO),
        symbolizer,
        max_frames: 64,
    }));

    alt_stack.activate().unwrap();
    dispatcher::publish(state);
    registrar::register_all(&mut dispositions, &MONITORED_SIGNALS, dispatcher::handle_signal)
        .unwrap();

    println!("crash handler installed, run with --crash to see a report");

    unsafe {
        if std::env::args().any(|a| a == "--crash") {
            let ptr: *mut u8 = std::ptr::null_mut();
            ptr.write_volatile(42);
        }
    }

    registrar::reset_all(&mut dispositions, &MONITORED_SIGNALS).unwrap();
    dispatcher::withdraw();
}
