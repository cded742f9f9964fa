//! Just enough SDP and ICE candidate handling for a single video stream over
//! a host UDP candidate.

use std::net::{IpAddr, SocketAddr};

use crate::error::NegotiationError;
use crate::message::PeerRole;

/// Host-candidate priority for a single UDP component.
pub const HOST_PRIORITY: u32 = 2_130_706_431;
pub const VIDEO_MID: &str = "0";

pub fn build(session_id: u64, addr: SocketAddr, role: PeerRole) -> String {
    let ip = addr.ip();
    let family = match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    format!(
        "v=0\r\n\
         o=- {session_id} 1 IN {family} {ip}\r\n\
         s=-\r\n\
         t=0 0\r\n\
         m=video {port} RTP/AVP 96\r\n\
         c=IN {family} {ip}\r\n\
         a=mid:{VIDEO_MID}\r\n\
         a=rtpmap:96 raw/90000\r\n\
         a=x-role:{role}\r\n",
        port = addr.port(),
    )
}

/// Accepts a description that starts with `v=0` and carries a video section.
pub fn validate(sdp: &str) -> Result<(), NegotiationError> {
    let mut lines = sdp.lines().map(str::trim).filter(|line| !line.is_empty());
    if lines.next() != Some("v=0") {
        return Err(NegotiationError::MalformedSdp(
            "description must start with v=0".into(),
        ));
    }
    if !lines.any(|line| line.starts_with("m=video ")) {
        return Err(NegotiationError::MalformedSdp(
            "no m=video section".into(),
        ));
    }
    Ok(())
}

pub fn candidate_line(addr: SocketAddr) -> String {
    format!(
        "candidate:1 1 UDP {HOST_PRIORITY} {} {} typ host",
        addr.ip(),
        addr.port()
    )
}

/// Address of a UDP candidate line
/// (`candidate:<foundation> <component> UDP <priority> <ip> <port> typ <type>`).
pub fn parse_candidate(line: &str) -> Result<SocketAddr, NegotiationError> {
    let malformed = |reason: &str| NegotiationError::MalformedCandidate(format!("{reason}: {line:?}"));

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(malformed("too few fields"));
    }
    if !fields[0].starts_with("candidate:") {
        return Err(malformed("missing candidate: prefix"));
    }
    if !fields[2].eq_ignore_ascii_case("udp") {
        return Err(malformed("only UDP candidates are supported"));
    }
    if fields[6] != "typ" {
        return Err(malformed("missing typ"));
    }
    let ip: IpAddr = fields[4].parse().map_err(|_| malformed("bad address"))?;
    let port: u16 = fields[5].parse().map_err(|_| malformed("bad port"))?;
    if port == 0 {
        return Err(malformed("port 0"));
    }
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_description_validates() {
        let sdp = build(7, "127.0.0.1:9000".parse().expect("addr"), PeerRole::Recorder);
        assert!(validate(&sdp).is_ok());
        assert!(sdp.contains("m=video 9000 RTP/AVP 96"));
        assert!(sdp.contains("a=x-role:recorder"));
    }

    #[test]
    fn descriptions_without_version_or_video_are_rejected() {
        for sdp in ["", "garbage", "m=video 9 RTP/AVP 96\r\nv=0", "v=0\r\nm=audio 9 RTP/AVP 0"] {
            assert!(
                matches!(validate(sdp), Err(NegotiationError::MalformedSdp(_))),
                "{sdp:?}"
            );
        }
    }

    #[test]
    fn candidate_line_parses_back() {
        let addr: SocketAddr = "10.1.2.3:5004".parse().expect("addr");
        assert_eq!(parse_candidate(&candidate_line(addr)).expect("parse"), addr);
    }

    #[test]
    fn foreign_candidates_parse() {
        let line = "candidate:842163049 1 udp 1677729535 192.168.1.20 50123 typ srflx raddr 0.0.0.0 rport 0";
        assert_eq!(
            parse_candidate(line).expect("parse"),
            "192.168.1.20:50123".parse::<SocketAddr>().expect("addr")
        );
    }

    #[test]
    fn bad_candidates_are_rejected() {
        for line in [
            "",
            "candidate:1 1 TCP 1 10.0.0.1 80 typ host",
            "candidate:1 1 UDP 1 not-an-ip 80 typ host",
            "candidate:1 1 UDP 1 10.0.0.1 0 typ host",
            "1 1 UDP 1 10.0.0.1 80 typ host",
        ] {
            assert!(
                matches!(parse_candidate(line), Err(NegotiationError::MalformedCandidate(_))),
                "{line:?}"
            );
        }
    }
}
