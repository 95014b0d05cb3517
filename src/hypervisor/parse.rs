//! Parsers for `VBoxManage` output and the lease database.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::{HypervisorError, MachineInfo, NicInfo, PowerState};

/// Lease state the lease service writes once an address is no longer valid.
const EXPIRED_STATE: &str = "expired";

/// Key prefixes in `showvminfo --machinereadable` naming an adapter's
/// attachment.
const ATTACHMENT_KEYS: [&str; 3] = ["hostonlyadapter", "natnet", "bridgeadapter"];

/// Normalises a MAC address to lower-case colon form.
///
/// Accepts both the bare twelve digit form (`080027AABBCC`) reported by
/// the machine status and the colon form used by the lease database.
/// Returns `None` when the input is not a MAC address.
#[must_use]
pub fn normalise_mac(raw: &str) -> Option<String> {
    let digits: Vec<char> = raw
        .chars()
        .filter(|ch| *ch != ':' && *ch != '-')
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    if digits.len() != 12 || !digits.iter().all(char::is_ascii_hexdigit) {
        return None;
    }
    let pairs: Vec<String> = digits.chunks(2).map(|pair| pair.iter().collect()).collect();
    Some(pairs.join(":"))
}

/// Extracts machine names from `list vms` output (`"name" {uuid}` lines).
pub(super) fn parse_vm_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once('"')?;
            let (name, _) = rest.rsplit_once('"')?;
            Some(name.to_owned())
        })
        .collect()
}

/// Extracts interface names from `list hostonlyifs` output.
pub(super) fn parse_network_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Name").then(|| value.trim().to_owned())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Extracts the issued interface name from `hostonlyif create` output, for
/// example `Interface 'vboxnet3' was successfully created`.
pub(super) fn parse_created_network(output: &str) -> Result<String, HypervisorError> {
    output
        .lines()
        .filter(|line| line.contains("successfully created"))
        .find_map(|line| {
            let (_, rest) = line.split_once('\'')?;
            let (name, _) = rest.split_once('\'')?;
            Some(name.to_owned())
        })
        .ok_or_else(|| HypervisorError::Parse {
            what: String::from("hostonlyif create output"),
            message: format!("no interface name in {:?}", output.trim()),
        })
}

fn unquote(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(trimmed)
}

fn trailing_index(key: &str, prefix: &str) -> Option<u8> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Parses `showvminfo --machinereadable` output.
pub(super) fn parse_machine_info(vmname: &str, output: &str) -> Result<MachineInfo, HypervisorError> {
    let mut state = None;
    let mut os_type = None;
    let mut cpus = None;
    let mut memory_mb = None;
    let mut networks: BTreeMap<u8, String> = BTreeMap::new();
    let mut macs: BTreeMap<u8, String> = BTreeMap::new();

    for line in output.lines() {
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = unquote(raw_key);
        let value = unquote(raw_value);
        match key {
            "VMState" => state = Some(PowerState::from_raw(value)),
            "ostype" => os_type = Some(value.to_owned()),
            "cpus" => cpus = value.parse().ok(),
            "memory" => memory_mb = value.parse().ok(),
            _ => {
                if let Some(index) = trailing_index(key, "macaddress") {
                    if let Some(mac) = normalise_mac(value) {
                        macs.insert(index, mac);
                    }
                    continue;
                }
                if let Some(index) = ATTACHMENT_KEYS
                    .iter()
                    .find_map(|prefix| trailing_index(key, prefix))
                {
                    networks.insert(index, value.to_owned());
                }
            }
        }
    }

    let state = state.ok_or_else(|| HypervisorError::Parse {
        what: format!("showvminfo {vmname}"),
        message: String::from("VMState missing"),
    })?;
    let nics = networks
        .into_iter()
        .map(|(index, network)| {
            let mac = macs.remove(&index);
            (index, NicInfo { network, mac })
        })
        .collect();

    Ok(MachineInfo {
        state,
        os_type,
        cpus,
        memory_mb,
        nics,
    })
}

fn attribute<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(" {name}=\"");
    let (_, rest) = element.split_once(needle.as_str())?;
    let (value, _) = rest.split_once('"')?;
    Some(value)
}

/// Parses the lease database XML into a MAC to address map, skipping
/// expired leases and entries without an address.
pub(super) fn parse_leases(
    network: &str,
    xml: &str,
) -> Result<BTreeMap<String, Ipv4Addr>, HypervisorError> {
    let mut leases = BTreeMap::new();
    for chunk in xml.split("<Lease ").skip(1) {
        let body = chunk.split_once("</Lease>").map_or(chunk, |(body, _)| body);
        let opening = format!(" {}", body.split_once('>').map_or(body, |(tag, _)| tag));
        if attribute(&opening, "state") == Some(EXPIRED_STATE) {
            continue;
        }
        let Some(mac) = attribute(&opening, "mac").and_then(normalise_mac) else {
            continue;
        };
        let Some(address) = body
            .split_once("<Address")
            .and_then(|(_, rest)| attribute(rest, "value"))
        else {
            continue;
        };
        let parsed = address.parse().map_err(|err| HypervisorError::Parse {
            what: format!("lease database of {network}"),
            message: format!("invalid address {address:?}: {err}"),
        })?;
        leases.insert(mac, parsed);
    }
    Ok(leases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("080027AABBCC", Some("08:00:27:aa:bb:cc"))]
    #[case("08:00:27:AA:BB:CC", Some("08:00:27:aa:bb:cc"))]
    #[case("0800", None)]
    #[case("zz0027aabbcc", None)]
    fn normalises_mac_addresses(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalise_mac(raw).as_deref(), expected);
    }

    #[test]
    fn parses_vm_listing() {
        let output = "\"web-1\" {0b4d3c0e-1111-2222-3333-444455556666}\n\"db \\\"x\\\"\" {abc}\n";
        let names = parse_vm_names(output);
        assert_eq!(names.first().map(String::as_str), Some("web-1"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn parses_hostonly_listing() {
        let output = "Name:            vboxnet0\nGUID:            786f6276-656e-4074-8000-0a0027000000\n\
                      VBoxNetworkName: HostInterfaceNetworking-vboxnet0\n\n\
                      Name:            vboxnet2\nDHCP:            Disabled\n";
        assert_eq!(parse_network_names(output), vec!["vboxnet0", "vboxnet2"]);
    }

    #[test]
    fn parses_issued_network_name() {
        let output = "0%...10%...100%\nInterface 'vboxnet3' was successfully created\n";
        assert_eq!(
            parse_created_network(output).expect("name should parse"),
            "vboxnet3"
        );
    }

    #[test]
    fn rejects_create_output_without_name() {
        let err = parse_created_network("0%...100%\n").expect_err("no name present");
        assert!(matches!(err, HypervisorError::Parse { .. }));
    }

    #[test]
    fn parses_machine_readable_status() {
        let output = concat!(
            "name=\"web-1\"\n",
            "ostype=\"Ubuntu (64-bit)\"\n",
            "memory=2048\n",
            "cpus=2\n",
            "VMState=\"running\"\n",
            "nic1=\"hostonly\"\n",
            "hostonlyadapter1=\"vboxnet0\"\n",
            "macaddress1=\"080027AABBCC\"\n",
            "nic2=\"nat\"\n",
            "natnet2=\"nat\"\n",
            "macaddress2=\"080027DDEEFF\"\n",
            "\"SATA-0-0\"=\"/vms/web-1.vdi\"\n",
        );
        let info = parse_machine_info("web-1", output).expect("status should parse");
        assert_eq!(info.state, PowerState::Running);
        assert_eq!(info.os_type.as_deref(), Some("Ubuntu (64-bit)"));
        assert_eq!(info.cpus, Some(2));
        assert_eq!(info.memory_mb, Some(2048));
        assert_eq!(info.nics.len(), 2);
        let first = info.nics.get(&1).expect("adapter 1 present");
        assert_eq!(first.network, "vboxnet0");
        assert_eq!(first.mac.as_deref(), Some("08:00:27:aa:bb:cc"));
        let second = info.nics.get(&2).expect("adapter 2 present");
        assert_eq!(second.network, "nat");
    }

    #[test]
    fn machine_status_requires_state() {
        let err = parse_machine_info("web-1", "cpus=1\n").expect_err("state is mandatory");
        assert!(matches!(err, HypervisorError::Parse { .. }));
    }

    #[test]
    fn parses_leases_and_skips_expired() {
        let xml = r#"<?xml version="1.0"?>
<Leases version="1.0">
  <Lease mac="08:00:27:aa:bb:cc" id="01" state="acked">
    <Address value="10.0.0.101"/>
    <Time issued="1600000000" expiration="600"/>
  </Lease>
  <Lease mac="08:00:27:dd:ee:ff" id="02" state="expired">
    <Address value="10.0.0.102"/>
  </Lease>
</Leases>
"#;
        let leases = parse_leases("vboxnet0", xml).expect("leases should parse");
        assert_eq!(leases.len(), 1);
        assert_eq!(
            leases.get("08:00:27:aa:bb:cc"),
            Some(&Ipv4Addr::new(10, 0, 0, 101))
        );
    }

    #[test]
    fn rejects_malformed_lease_address() {
        let xml = r#"<Lease mac="08:00:27:aa:bb:cc" state="acked"><Address value="10.0.0"/></Lease>"#;
        let err = parse_leases("vboxnet0", xml).expect_err("address is malformed");
        assert!(matches!(err, HypervisorError::Parse { .. }));
    }
}
