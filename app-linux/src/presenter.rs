//! Text rendering of the indicator menu: a header line with the connection
//! state followed by one line per detail that has a value.

use log::info;
use mullvad_indicator_core::platform::StatusPresenter;
use mullvad_indicator_core::{ModelState, VpnStatus};

pub struct LogPresenter;

impl LogPresenter {
    pub fn lines(status: &VpnStatus, state: ModelState) -> Vec<String> {
        std::iter::once(state.label().to_string())
            .chain(status.visible_details().map(|entry| format!("  {entry}")))
            .collect()
    }
}

impl StatusPresenter for LogPresenter {
    fn render(&self, status: &VpnStatus, state: ModelState) {
        for line in Self::lines(status, state) {
            info!("{line}");
        }
    }
}
