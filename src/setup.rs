use crate::{
    BoardConfig, DaqError, Digitizer, Edge, IoLevel, Setting, SignalLevel, TriggerMode,
    TriggerUse, CHANNELS_PER_GROUP, MAX_GROUPS,
};
use log::{info, warn};

/// Fast trigger inputs TR0 and TR1 are wired to groups 0 and 2.
const FAST_TRIGGER_GROUPS: [u8; 2] = [0, 2];

/// Fast trigger DC offset and threshold for each signal standard.
fn fast_trigger_levels(level: IoLevel) -> (u32, u32) {
    match level {
        IoLevel::Nim => (0x8000, 0x51C6),
        IoLevel::Ttl => (0xA800, 0x6666),
    }
}

/// The ordered configuration sequence for a board.
pub fn board_settings(board: &BoardConfig) -> Vec<Setting> {
    let mut settings = vec![
        Setting::Reset,
        Setting::SamplingFrequency(board.sampling),
        Setting::RecordLength(board.record_length),
        Setting::GroupEnableMask(board.group_enable_mask),
    ];

    for group in (0..MAX_GROUPS).filter(|g| board.group_enabled(*g)) {
        for ch in group * CHANNELS_PER_GROUP..(group + 1) * CHANNELS_PER_GROUP {
            settings.push(Setting::ChannelDcOffset {
                channel: ch as u8,
                offset: board.offsets[ch],
            });
        }
    }
    settings.push(Setting::PostTriggerSize(board.post_trigger_size));

    let level = match board.io_level {
        IoLevel::Nim => SignalLevel::Nim,
        IoLevel::Ttl => SignalLevel::Ttl,
    };
    match board.trigger_mode {
        TriggerMode::External => settings.extend([
            Setting::SwTriggerMode(TriggerUse::Disabled),
            Setting::FastTriggerMode(TriggerUse::Disabled),
            Setting::ExtTriggerInputMode(TriggerUse::AcqAndExtOut),
            Setting::IoLevel(level),
        ]),
        // rejected when the run context is built
        TriggerMode::Fast | TriggerMode::Software => {
            settings.extend([
                Setting::SwTriggerMode(TriggerUse::Disabled),
                Setting::ExtTriggerInputMode(TriggerUse::Disabled),
                Setting::FastTriggerMode(TriggerUse::AcqOnly),
                Setting::FastTriggerDigitizing(true),
                Setting::TriggerPolarity(match level {
                    SignalLevel::Nim => Edge::Falling,
                    SignalLevel::Ttl => Edge::Rising,
                }),
            ]);
            let (offset, threshold) = fast_trigger_levels(board.io_level);
            for group in FAST_TRIGGER_GROUPS {
                settings.push(Setting::FastTriggerDcOffset { group, offset });
                settings.push(Setting::FastTriggerThreshold { group, threshold });
            }
        }
    }

    settings.push(Setting::MaxNumEventsBlt(board.max_num_events_blt));
    if board.drs4_correction {
        settings.push(Setting::LoadDrs4Correction(board.sampling));
        settings.push(Setting::Drs4Correction(true));
    } else {
        settings.push(Setting::Drs4Correction(false));
    }
    settings.push(Setting::AcquisitionMode(board.start_mode));
    settings
}

/// Apply `settings` in order, stopping at the first one the board rejects.
pub fn configure<D: Digitizer>(digitizer: &mut D, settings: &[Setting]) -> Result<(), DaqError> {
    for setting in settings {
        match setting {
            Setting::Drs4Correction(false) => warn!("DRS4 corrections are DISABLED"),
            Setting::ChannelDcOffset { .. } => (),
            other => info!("- Setting {other:?}"),
        }
        digitizer
            .apply(setting)
            .map_err(|code| DaqError::Configuration {
                setting: format!("{setting:?}"),
                code,
            })?;
    }
    info!("Board configured with {} settings", settings.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::ScriptedDigitizer, Conf, DgtzError, RunContext, StartMode};
    use confique::Config;

    fn board(configure: impl FnOnce(&mut Conf)) -> BoardConfig {
        let mut conf = Conf::builder().load().unwrap();
        configure(&mut conf);
        RunContext::from_conf(&conf).unwrap().board
    }

    #[test]
    fn offsets_cover_enabled_groups_only() {
        let board = board(|c| c.board.group_enable_mask = 0b0100);
        let channels: Vec<u8> = board_settings(&board)
            .iter()
            .filter_map(|s| match s {
                Setting::ChannelDcOffset { channel, .. } => Some(*channel),
                _ => None,
            })
            .collect();
        assert_eq!(channels, (16..24).collect::<Vec<u8>>());
    }

    #[test]
    fn fast_trigger_on_nim() {
        let settings = board_settings(&board(|_| ()));
        assert_eq!(settings[0], Setting::Reset);
        assert!(settings.contains(&Setting::FastTriggerMode(TriggerUse::AcqOnly)));
        assert!(settings.contains(&Setting::TriggerPolarity(Edge::Falling)));
        assert!(settings.contains(&Setting::FastTriggerThreshold {
            group: 2,
            threshold: 0x51C6
        }));
        assert!(settings.contains(&Setting::FastTriggerDcOffset {
            group: 0,
            offset: 0x8000
        }));
        assert_eq!(
            settings.last(),
            Some(&Setting::AcquisitionMode(StartMode::Software))
        );
    }

    #[test]
    fn external_trigger_on_ttl_without_corrections() {
        let settings = board_settings(&board(|c| {
            c.board.trigger_mode = TriggerMode::External;
            c.board.trigger_iolevel = IoLevel::Ttl;
            c.board.drs4corr_enable = false;
        }));
        assert!(settings.contains(&Setting::ExtTriggerInputMode(TriggerUse::AcqAndExtOut)));
        assert!(settings.contains(&Setting::IoLevel(SignalLevel::Ttl)));
        assert!(!settings
            .iter()
            .any(|s| matches!(s, Setting::FastTriggerThreshold { .. })));
        assert!(settings.contains(&Setting::Drs4Correction(false)));
        assert!(!settings
            .iter()
            .any(|s| matches!(s, Setting::LoadDrs4Correction(_))));
    }

    #[test]
    fn configure_stops_at_first_rejection() {
        let settings = board_settings(&board(|_| ()));
        let mut dig = ScriptedDigitizer::new();
        dig.fail_setting = Some((4, DgtzError::InvalidParam));
        let err = configure(&mut dig, &settings).unwrap_err();
        assert!(matches!(
            err,
            DaqError::Configuration {
                code: DgtzError::InvalidParam,
                ..
            }
        ));
        assert_eq!(dig.applied.len(), 4);

        let mut dig = ScriptedDigitizer::new();
        configure(&mut dig, &settings).unwrap();
        assert_eq!(dig.applied, settings);
    }
}
