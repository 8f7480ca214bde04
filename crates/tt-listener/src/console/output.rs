//! Output formatting for the operator console

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};

use crate::tunnel::{ForwardInfo, SocksInfo};

/// Format connected agents with their 1-based console numbers
pub fn format_clients(clients: &[String]) -> String {
    if clients.is_empty() {
        return "No clients connected".to_string();
    }

    #[derive(Tabled)]
    struct ClientRow {
        #[tabled(rename = "ID")]
        id: usize,
        #[tabled(rename = "ADDRESS")]
        address: String,
    }

    let rows = clients.iter().enumerate().map(|(i, address)| ClientRow {
        id: i + 1,
        address: address.clone(),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format running forwards and SOCKS5 listeners as one table
pub fn format_tunnels(forwards: &[ForwardInfo], socks: &[SocksInfo]) -> String {
    if forwards.is_empty() && socks.is_empty() {
        return "No tunnels running".to_string();
    }

    #[derive(Tabled)]
    struct TunnelRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "KIND")]
        kind: &'static str,
        #[tabled(rename = "LOCAL")]
        local: String,
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "CONNS")]
        connections: usize,
    }

    let forward_rows = forwards.iter().map(|f| TunnelRow {
        id: f.id.clone(),
        kind: "forward",
        local: f.local_addr.to_string(),
        target: f.remote_addr.clone(),
        connections: f.connections,
    });
    let socks_rows = socks.iter().map(|s| TunnelRow {
        id: s.id.clone(),
        kind: "socks5",
        local: s.local_addr.to_string(),
        target: "*".to_string(),
        connections: s.connections,
    });
    Table::new(forward_rows.chain(socks_rows))
        .with(Style::rounded())
        .to_string()
}

fn print_colored(out: &mut impl Write, color: Color, prefix: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(prefix),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Green checkmark line
pub fn print_success(out: &mut impl Write, msg: &str) {
    print_colored(out, Color::Green, "✓ ", msg);
}

/// Red cross line
pub fn print_error(out: &mut impl Write, msg: &str) {
    print_colored(out, Color::Red, "✗ ", msg);
}

/// Cyan info line
pub fn print_info(out: &mut impl Write, msg: &str) {
    print_colored(out, Color::Cyan, "ℹ ", msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_clients() {
        assert_eq!(format_clients(&[]), "No clients connected");

        let table = format_clients(&["10.0.0.5:5678".into(), "192.168.1.2:1234".into()]);
        assert!(table.contains("ADDRESS"));
        let first = table.lines().position(|l| l.contains("10.0.0.5:5678")).unwrap();
        let second = table.lines().position(|l| l.contains("192.168.1.2:1234")).unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_format_tunnels() {
        assert_eq!(format_tunnels(&[], &[]), "No tunnels running");

        let forwards = vec![ForwardInfo {
            id: "web".into(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
            remote_addr: "10.0.0.1:80".into(),
            connections: 2,
        }];
        let socks = vec![SocksInfo {
            id: "proxy".into(),
            local_addr: "127.0.0.1:1080".parse().unwrap(),
            connections: 0,
        }];
        let table = format_tunnels(&forwards, &socks);
        assert!(table.contains("10.0.0.1:80"));
        assert!(table.contains("socks5"));
    }

    #[test]
    fn test_print_helpers_write_message() {
        let mut out = Vec::new();
        print_error(&mut out, "upload failed");
        assert!(String::from_utf8(out).unwrap().contains("upload failed"));
    }
}
