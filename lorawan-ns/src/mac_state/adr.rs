//! Adaptive data rate
//!
//! The link margin is estimated from the best SNR over the recent ADR
//! uplinks. Every 3 dB of margin above the installation margin raises the
//! data rate and, once at the highest ADR data rate, lowers the TX power
//! (higher TX power index). A negative margin raises the power again.
//! NbTrans follows the frame loss rate.

use std::collections::BTreeSet;

use tracing::trace;

use crate::device::{MacState, UplinkRecord};
use crate::error::Result;
use crate::lorawan::region::Band;

/// dB per ADR step
const STEP_DB: f32 = 3.0;

fn nb_trans_for_loss(loss: f32) -> u8 {
    if loss < 0.05 {
        1
    } else if loss < 0.10 {
        2
    } else {
        3
    }
}

/// Frame loss rate over data uplinks, from gaps in their counters
pub fn loss_rate<'a>(uplinks: impl IntoIterator<Item = &'a UplinkRecord>) -> Option<f32> {
    let f_cnts: BTreeSet<u32> = uplinks.into_iter().map(|up| up.f_cnt).collect();
    let (first, last) = (*f_cnts.first()?, *f_cnts.last()?);
    if f_cnts.len() < 2 {
        return None;
    }
    let expected = (last - first) as f32 + 1.0;
    Some(1.0 - f_cnts.len() as f32 / expected)
}

/// Update the desired ADR parameters from the recent uplinks
///
/// Only uplinks of the current ADR run at the last data rate are considered;
/// nothing changes if the last uplink did not request ADR.
pub fn adapt(state: &mut MacState, band: &Band, margin_db: f32) -> Result<()> {
    let Some(last) = state.last_uplink().filter(|up| up.is_data() && up.f_ctrl.adr) else {
        return Ok(());
    };
    let dr = last.settings.data_rate_index;
    let uplinks: Vec<&UplinkRecord> = state
        .recent_uplinks
        .iter()
        .filter(|up| up.is_data() && up.f_ctrl.adr && up.settings.data_rate_index == dr)
        .collect();
    let max_snr = uplinks
        .iter()
        .flat_map(|up| up.rx_metadata.iter())
        .map(|md| md.snr)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_snr.is_finite() {
        return Ok(());
    }
    let nb_trans = loss_rate(uplinks.iter().copied()).map(nb_trans_for_loss);

    let margin = max_snr - band.data_rate(dr)?.required_snr() - margin_db;
    let mut steps = (margin / STEP_DB).floor() as i32;
    let mut dr = dr;
    let mut tx = state.current_parameters.adr_tx_power_index;
    while steps > 0 && dr < band.max_adr_data_rate_index {
        dr += 1;
        steps -= 1;
    }
    while steps > 0 && tx < band.max_tx_power_index {
        tx += 1;
        steps -= 1;
    }
    while steps < 0 && tx > 0 {
        tx -= 1;
        steps += 1;
    }
    trace!(margin, data_rate_index = dr, tx_power_index = tx, "ADR");

    let desired = &mut state.desired_parameters;
    desired.adr_data_rate_index = dr;
    desired.adr_tx_power_index = tx;
    if let Some(nb_trans) = nb_trans {
        desired.adr_nb_trans = nb_trans;
    }
    Ok(())
}
