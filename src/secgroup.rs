use std::net::Ipv4Addr;

use iptables::IPTables;
use mac_address::MacAddress;
use scopeguard::ScopeGuard;

use crate::error::{AgentError, Result};

/// iptables allows 30 bytes including the terminator; stay one below.
const MAX_CHAIN_NAME_LEN: usize = 29;

const TABLE_FILTER: &str = "filter";

const CHAIN_INPUT: &str = "INPUT";
const CHAIN_FORWARD: &str = "FORWARD";
const CHAIN_SG_FALLBACK: &str = "fallback";
const CHAIN_SG: &str = "sg-chain";
const CHAIN_AGENT_INPUT: &str = "INPUT-chain";
const CHAIN_AGENT_FORWARD: &str = "FORWARD-chain";

const IN_PREFIX: &str = "in-";
const OUT_PREFIX: &str = "out-";
const SOURCE_PREFIX: &str = "source-";

/// Per-interface chain name, truncated to the iptables limit.
pub fn chain_name(prefix: &str, interface: &str) -> String {
    let mut name = format!("{prefix}{interface}");
    name.truncate(MAX_CHAIN_NAME_LEN);
    name
}

fn new_client() -> Result<IPTables> {
    iptables::new(false).map_err(|e| AgentError::internal(format!("failed to open iptables: {e}")))
}

fn ipt<T>(
    result: std::result::Result<T, Box<dyn std::error::Error>>,
    context: &str,
) -> Result<T> {
    result.map_err(|e| AgentError::internal(format!("{context}: {e}")))
}

fn ensure_chain(client: &IPTables, chain: &str) -> Result<()> {
    if ipt(
        client.chain_exists(TABLE_FILTER, chain),
        "failed to probe chain",
    )? {
        return Ok(());
    }
    ipt(
        client.new_chain(TABLE_FILTER, chain),
        &format!("failed to create chain {chain}"),
    )
}

/// Install the shared chain hierarchy: a terminal drop chain, the
/// security-group dispatch chain, and per-table entry chains jumped to
/// from INPUT and FORWARD. Safe to run on every boot.
pub fn setup_default_security_group() -> Result<()> {
    let client = new_client()?;

    ensure_chain(&client, CHAIN_SG_FALLBACK)?;
    ipt(
        client.append_unique(TABLE_FILTER, CHAIN_SG_FALLBACK, "-j DROP"),
        "failed to append fallback drop",
    )?;

    ensure_chain(&client, CHAIN_SG)?;
    ipt(
        client.append_unique(TABLE_FILTER, CHAIN_SG, "-j ACCEPT"),
        "failed to append sg-chain accept",
    )?;

    ensure_chain(&client, CHAIN_AGENT_INPUT)?;
    ipt(
        client.append_unique(
            TABLE_FILTER,
            CHAIN_INPUT,
            &format!("-j {CHAIN_AGENT_INPUT}"),
        ),
        "failed to hook INPUT",
    )?;

    ensure_chain(&client, CHAIN_AGENT_FORWARD)?;
    ipt(
        client.append_unique(
            TABLE_FILTER,
            CHAIN_FORWARD,
            &format!("-j {CHAIN_AGENT_FORWARD}"),
        ),
        "failed to hook FORWARD",
    )?;

    Ok(())
}

/// Anti-spoof chain: only the given IP/MAC pair may talk.
fn source_rules(ip: Ipv4Addr, mac: MacAddress) -> Vec<String> {
    vec![
        format!("-s {ip}/32 -m mac --mac-source {mac} -j RETURN"),
        "-j DROP".to_string(),
    ]
}

/// Traffic forwarded into the bridge towards the VM.
fn in_rules() -> Vec<String> {
    vec![
        "-m state --state RELATED,ESTABLISHED -j RETURN".to_string(),
        "-p udp -m udp --sport 67 --dport 68 -j RETURN".to_string(),
        "-p tcp -m tcp -m multiport --dports 1:65535 -j RETURN".to_string(),
        "-p udp -m udp -m multiport --dports 1:65535 -j RETURN".to_string(),
        "-p icmp -j RETURN".to_string(),
        format!("-j {CHAIN_SG_FALLBACK}"),
    ]
}

/// Traffic originated by the VM. DHCP client traffic is allowed before
/// the anti-spoof check (the client has no address yet); a VM answering
/// as a DHCP server is dropped.
fn out_rules(source_chain: &str) -> Vec<String> {
    vec![
        "-p udp -m udp --sport 68 --dport 67 -j RETURN".to_string(),
        format!("-j {source_chain}"),
        "-p udp -m udp --sport 67 --dport 68 -j DROP".to_string(),
        "-m state --state RELATED,ESTABLISHED -j RETURN".to_string(),
        "-p tcp -m tcp -m multiport --dports 1:65535 -j RETURN".to_string(),
        "-p udp -m udp -m multiport --dports 1:65535 -j RETURN".to_string(),
        "-p icmp -j RETURN".to_string(),
        "-j RETURN".to_string(),
        format!("-j {CHAIN_SG_FALLBACK}"),
    ]
}

fn sg_jump_rules(interface: &str, in_chain: &str, out_chain: &str) -> Vec<String> {
    vec![
        format!("-m physdev --physdev-out {interface} --physdev-is-bridged -j {in_chain}"),
        format!("-m physdev --physdev-in {interface} --physdev-is-bridged -j {out_chain}"),
    ]
}

fn forward_jump_rules(interface: &str, out_chain: &str) -> Vec<String> {
    vec![
        format!("-m physdev --physdev-out {interface} --physdev-is-bridged -j {CHAIN_SG}"),
        format!("-m physdev --physdev-in {interface} --physdev-is-bridged -j {CHAIN_SG}"),
        format!("-m physdev --physdev-in {interface} --physdev-is-bridged -j {out_chain}"),
    ]
}

/// Build one per-interface chain. On any rule failure the chain is
/// cleared and deleted before the error is returned, so a retry starts
/// from a clean slate; this is the only compensated operation in the
/// agent.
fn install_chain(client: &IPTables, chain: &str, rules: &[String]) -> Result<()> {
    ensure_chain(client, chain)?;
    ipt(
        client.flush_chain(TABLE_FILTER, chain),
        &format!("failed to flush chain {chain}"),
    )?;

    let cleanup = scopeguard::guard((), |()| {
        let _ = client.flush_chain(TABLE_FILTER, chain);
        let _ = client.delete_chain(TABLE_FILTER, chain);
    });
    for rule in rules {
        ipt(
            client.append(TABLE_FILTER, chain, rule),
            &format!("failed to append rule to {chain}"),
        )?;
    }
    ScopeGuard::into_inner(cleanup);
    Ok(())
}

/// Insert jumps at the top of an existing chain, keeping the listed
/// order and skipping jumps that are already present.
fn insert_jumps(client: &IPTables, chain: &str, rules: &[String]) -> Result<()> {
    let mut position = 1;
    for rule in rules {
        if ipt(
            client.exists(TABLE_FILTER, chain, rule),
            &format!("failed to probe rule in {chain}"),
        )? {
            continue;
        }
        ipt(
            client.insert(TABLE_FILTER, chain, rule, position),
            &format!("failed to insert jump into {chain}"),
        )?;
        position += 1;
    }
    Ok(())
}

/// Bind the security-group chain set to one guest interface.
pub fn add_security_group(interface: &str, ip: Ipv4Addr, mac: MacAddress) -> Result<()> {
    let client = new_client()?;

    let source_chain = chain_name(SOURCE_PREFIX, interface);
    let in_chain = chain_name(IN_PREFIX, interface);
    let out_chain = chain_name(OUT_PREFIX, interface);

    install_chain(&client, &source_chain, &source_rules(ip, mac))?;
    install_chain(&client, &in_chain, &in_rules())?;
    install_chain(&client, &out_chain, &out_rules(&source_chain))?;

    insert_jumps(
        &client,
        CHAIN_SG,
        &sg_jump_rules(interface, &in_chain, &out_chain),
    )?;
    insert_jumps(
        &client,
        CHAIN_AGENT_FORWARD,
        &forward_jump_rules(interface, &out_chain),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_carry_the_interface() {
        assert_eq!(chain_name(IN_PREFIX, "tap001"), "in-tap001");
        assert_eq!(chain_name(OUT_PREFIX, "tap001"), "out-tap001");
        assert_eq!(chain_name(SOURCE_PREFIX, "tap001"), "source-tap001");
    }

    #[test]
    fn chain_names_never_exceed_the_iptables_limit() {
        for prefix in [IN_PREFIX, OUT_PREFIX, SOURCE_PREFIX] {
            let name = chain_name(prefix, "very-long-guest-interface-name-000");
            assert!(name.len() <= MAX_CHAIN_NAME_LEN);
            assert!(name.starts_with(prefix));
        }
        // short names are untouched
        assert_eq!(chain_name(SOURCE_PREFIX, "tap0"), "source-tap0");
    }

    #[test]
    fn source_rules_allow_the_pair_then_drop() {
        let mac: MacAddress = "52:54:00:00:00:01".parse().unwrap();
        let rules = source_rules("10.0.0.1".parse().unwrap(), mac);
        assert_eq!(rules.len(), 2);
        assert!(rules[0].starts_with("-s 10.0.0.1/32 -m mac --mac-source"));
        assert!(rules[0].ends_with("-j RETURN"));
        assert_eq!(rules[1], "-j DROP");
    }

    #[test]
    fn out_rules_check_dhcp_before_antispoof() {
        let rules = out_rules("source-tap001");
        assert_eq!(rules[0], "-p udp -m udp --sport 68 --dport 67 -j RETURN");
        assert_eq!(rules[1], "-j source-tap001");
        assert_eq!(rules[2], "-p udp -m udp --sport 67 --dport 68 -j DROP");
        assert_eq!(rules.last().unwrap(), &format!("-j {CHAIN_SG_FALLBACK}"));
    }

    #[test]
    fn in_rules_end_in_the_fallback_chain() {
        let rules = in_rules();
        assert_eq!(rules.len(), 6);
        assert_eq!(rules[0], "-m state --state RELATED,ESTABLISHED -j RETURN");
        assert_eq!(rules.last().unwrap(), &format!("-j {CHAIN_SG_FALLBACK}"));
    }

    #[test]
    fn jump_rules_cover_both_directions() {
        let sg = sg_jump_rules("tap001", "in-tap001", "out-tap001");
        assert_eq!(
            sg[0],
            "-m physdev --physdev-out tap001 --physdev-is-bridged -j in-tap001"
        );
        assert_eq!(
            sg[1],
            "-m physdev --physdev-in tap001 --physdev-is-bridged -j out-tap001"
        );

        let forward = forward_jump_rules("tap001", "out-tap001");
        assert_eq!(forward.len(), 3);
        assert!(forward[0].ends_with(&format!("-j {CHAIN_SG}")));
        assert!(forward[2].ends_with("-j out-tap001"));
    }
}
