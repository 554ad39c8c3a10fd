use mapforge::AbortToken;

/// First CTRL+C cancels the job cooperatively; a second one exits on the
/// spot with the conventional interrupt status.
pub fn spawn_ctrl_c_handler(abort: AbortToken) {
    tokio::spawn(async move {
        let mut presses: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            presses = presses.saturating_add(1);
            if presses == 1 {
                eprintln!(
                    "Stop requested — cancelling the job (press CTRL+C again to exit immediately)."
                );
                abort.abort();
            } else {
                eprintln!("Stop requested again — exiting immediately.");
                std::process::exit(130);
            }
        }
    });
}
