/// Codecs the video track can be encoded with.
pub const SUPPORTED_CODECS: [&str; 2] = ["H264", "VP8"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    pub compatible: bool,
    pub message: String,
}

impl Compatibility {
    fn yes(message: impl Into<String>) -> Self {
        Self { compatible: true, message: message.into() }
    }

    fn no(message: impl Into<String>) -> Self {
        Self { compatible: false, message: message.into() }
    }
}

/// Codec names advertised by an SDP: `a=rtpmap` encodings (upper-cased,
/// clock rate stripped) plus H264 for any `a=fmtp` line with a profile-level-id.
pub fn advertised_codecs(sdp: &str) -> Vec<String> {
    let mut codecs = Vec::new();
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some(enc) = rest.split_whitespace().nth(1) {
                codecs.push(enc.split('/').next().unwrap_or_default().to_uppercase());
            }
        } else if line.starts_with("a=fmtp:") && line.contains("profile-level-id") {
            codecs.push("H264".to_string());
        }
    }
    codecs
}

/// Permissive compatibility check for a remote offer. Only an explicit codec
/// list with nothing we can encode is rejected.
pub fn check(sdp: &str) -> Compatibility {
    if sdp.trim().is_empty() {
        return Compatibility::no("no remote SDP provided");
    }
    let codecs = advertised_codecs(sdp);
    if codecs.is_empty() {
        return if sdp.contains("m=video") {
            Compatibility::yes("no codec list, assuming compatibility from video section")
        } else {
            Compatibility::yes("no video codecs listed, assuming default compatibility")
        };
    }
    let usable: Vec<&str> = codecs
        .iter()
        .map(String::as_str)
        .filter(|c| SUPPORTED_CODECS.contains(c))
        .collect();
    if usable.is_empty() {
        Compatibility::no(format!("found incompatible codecs: {}", codecs.join(", ")))
    } else {
        Compatibility::yes(format!("found compatible codecs: {}", usable.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_OFFER: &str = "v=0\r\n\
o=- 46117317 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f\r\n";

    #[test]
    fn rtpmap_and_fmtp_tokens() {
        assert_eq!(advertised_codecs(CHROME_OFFER), vec!["VP8", "H264", "H264"]);
        assert!(check(CHROME_OFFER).compatible);
    }

    #[test]
    fn bare_video_section_is_compatible() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\n";
        let c = check(sdp);
        assert!(c.compatible);
        assert!(c.message.contains("video section"));
    }

    #[test]
    fn only_unsupported_codecs_is_rejected() {
        let sdp = "v=0\r\nm=video 9 RTP/SAVPF 98 100\r\na=rtpmap:98 VP9/90000\r\na=rtpmap:100 AV1/90000\r\n";
        let c = check(sdp);
        assert!(!c.compatible);
        assert_eq!(c.message, "found incompatible codecs: VP9, AV1");
    }

    #[test]
    fn lowercase_names_are_normalized() {
        assert!(check("m=video 9 RTP/AVP 96\na=rtpmap:96 vp8/90000\n").compatible);
    }

    #[test]
    fn empty_sdp_is_not_compatible() {
        assert!(!check("").compatible);
        assert!(check("v=0\r\nm=audio 9 RTP/AVP 0\r\n").compatible);
    }
}
