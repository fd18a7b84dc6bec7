use crate::model::ScannerCapabilities;

const ADDRESS_TERMINATOR: &str = "' is a ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub address: String,
    pub name: String,
}

pub fn parse_device_listing(output: &str) -> Vec<ListedDevice> {
    output.lines().filter_map(parse_device_line).collect()
}

fn parse_device_line(line: &str) -> Option<ListedDevice> {
    let line = line.trim();
    let rest = line.strip_prefix("device")?;

    // The address opens with a backtick in classic SANE output, a plain quote in newer builds.
    let open = rest.find('`').or_else(|| rest.find('\''))?;
    // Names can carry apostrophes of their own; the address ends at the first `' is a `.
    let quoted = &rest[open + 1..];
    let close = quoted.find(ADDRESS_TERMINATOR)?;
    let address = quoted[..close].trim();
    let name = quoted[close + ADDRESS_TERMINATOR.len()..].trim();
    if address.is_empty() || name.is_empty() {
        return None;
    }

    Some(ListedDevice {
        address: address.to_string(),
        name: name.to_string(),
    })
}

pub fn parse_capabilities(help: &str) -> ScannerCapabilities {
    let source = help
        .lines()
        .any(|line| line.trim().to_ascii_lowercase().contains("source"));

    ScannerCapabilities {
        multi_page: true,
        color: true,
        resolution: true,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_capabilities, parse_device_listing, ListedDevice};

    #[test]
    fn parses_fixture_listing() {
        let devices = parse_device_listing(include_str!("../../../fixtures/scanimage-list.txt"));
        assert_eq!(devices.len(), 3);
        assert_eq!(
            devices[0],
            ListedDevice {
                address: "fujitsu:fi-7030:211822".to_string(),
                name: "FUJITSU fi-7030 scanner".to_string(),
            }
        );
        assert_eq!(devices[2].address, "v4l:/dev/video0");
    }

    #[test]
    fn accepts_plain_quotes_and_skips_noise() {
        let output = "\
device 'airscan:e0:Brother MFC' is a eSCL Brother MFC ip=10.0.0.4
No scanners were identified. If you were expecting something different,
device `broken is a thing
";
        let devices = parse_device_listing(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "airscan:e0:Brother MFC");
        assert_eq!(devices[0].name, "eSCL Brother MFC ip=10.0.0.4");
    }

    #[test]
    fn names_with_apostrophes_keep_their_devices() {
        let devices =
            parse_device_listing(include_str!("../../../fixtures/scanimage-list-network.txt"));
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].address, "airscan:e0:Bob's MFC");
        assert_eq!(devices[0].name, "eSCL Bob's MFC ip=10.0.0.4");
        assert_eq!(
            devices[1],
            ListedDevice {
                address: "hp:usb:1".to_string(),
                name: "HP's OfficeJet scanner".to_string(),
            }
        );
        assert_eq!(devices[2].address, "airscan:w1:Brother MFC-L2750DW");
    }

    #[test]
    fn capabilities_from_help_text() {
        let caps = parse_capabilities(include_str!("../../../fixtures/scanimage-help.txt"));
        assert!(caps.resolution);
        assert!(caps.color);
        assert!(caps.source);
        assert!(caps.multi_page);
    }

    #[test]
    fn capabilities_default_when_help_is_silent() {
        let caps = parse_capabilities("Usage: scanimage [OPTION]...");
        assert!(caps.multi_page && caps.color && caps.resolution);
        assert!(!caps.source);
    }
}
