//! Network interface queries and offload tuning.

use crate::HalResult;
use std::collections::BTreeMap;

pub trait NetOps {
    /// Names of all network interfaces the kernel currently exposes.
    fn interfaces(&self) -> HalResult<Vec<String>>;

    fn interface_exists(&self, name: &str) -> HalResult<bool> {
        Ok(self.interfaces()?.iter().any(|i| i == name))
    }

    /// Current offload feature states (`ethtool -k`), keyed by feature name.
    fn offload_features(&self, iface: &str) -> HalResult<BTreeMap<String, bool>>;

    fn set_offload(&self, iface: &str, feature: &str, enabled: bool) -> HalResult<()>;
}

/// Parses `ethtool -k <iface>` output into `feature -> enabled`.
///
/// Lines look like `tcp-segmentation-offload: on` or
/// `rx-checksumming: off [fixed]`; the header line is skipped.
pub fn parse_ethtool_features(output: &str) -> BTreeMap<String, bool> {
    output
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.trim().split_once(':')?;
            let state = rest.split_whitespace().next()?;
            let enabled = match state {
                "on" => true,
                "off" => false,
                _ => return None,
            };
            Some((name.trim().to_string(), enabled))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ethtool_features_reads_states() {
        let out = "Features for usb0:\n\
                   rx-checksumming: on\n\
                   tcp-segmentation-offload: off\n\
                   \ttx-tcp-segmentation: off [fixed]\n\
                   generic-receive-offload: on\n";
        let features = parse_ethtool_features(out);
        assert_eq!(features.get("rx-checksumming"), Some(&true));
        assert_eq!(features.get("tcp-segmentation-offload"), Some(&false));
        assert_eq!(features.get("tx-tcp-segmentation"), Some(&false));
        assert!(!features.contains_key("Features for usb0"));
    }
}
