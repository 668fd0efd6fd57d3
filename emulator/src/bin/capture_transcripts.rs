//! Records canned console sessions for every simulated bus profile.

use std::io;
use std::path::PathBuf;

#[path = "../session.rs"]
mod session;
#[path = "../sim.rs"]
mod sim;

use session::{Session, SessionOptions};
use sim::SimProfile;

const TRANSCRIPT_DIR: &str = "transcripts";

fn main() -> io::Result<()> {
    env_logger::init();
    for profile in SimProfile::ALL {
        record_profile(profile)?;
    }
    Ok(())
}

fn record_profile(profile: SimProfile) -> io::Result<()> {
    let mut options = SessionOptions::new(profile);
    let path = PathBuf::from(TRANSCRIPT_DIR).join(format!("emulator-{}.log", profile.tag()));
    options.transcript = Some(path);
    let mut session = Session::new(options)?;

    for line in script(profile) {
        session.handle_command(line)?;
    }
    Ok(())
}

fn script(profile: SimProfile) -> &'static [&'static str] {
    match profile {
        SimProfile::Open => &[
            "help",
            "calibrate sdr104",
            "calibrate sdr104",
            "crc sdr104",
            "calibrate sdr104",
            "reset sdr104",
            "fault reselect tx=3 rx=8",
            "calibrate sdr104",
            "status",
            "calibrate sdr104",
        ],
        SimProfile::Narrow => &["calibrate", "status", "reset", "calibrate"],
        SimProfile::LockLoss => &[
            "calibrate sdr50",
            "stats sdr50",
            "calibrate sdr50",
            "stats sdr50",
        ],
        SimProfile::Marginal => &["fault nolock", "calibrate", "stats", "status"],
    }
}
