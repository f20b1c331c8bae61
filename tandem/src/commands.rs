//! Interactive commands read from stdin

use tandem_core::models::PeerId;
use tandem_rtc::TrackKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    ToggleAudio,
    ToggleVideo,
    Negotiate,
    Restart,
    SwitchDevice { kind: TrackKind, device: String },
    Call(PeerId),
    Accept(PeerId),
    Reject(PeerId),
    End(PeerId),
    Roster,
    Stats,
    History,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                 send a chat message
  /audio, /video         toggle microphone or camera
  /negotiate             start a new negotiation round
  /restart               rebuild the media connection
  /device audio|video <name>
                         switch capture device
  /call <peer>           call a participant
  /accept <peer>         accept an incoming call
  /reject <peer>         reject an incoming call
  /end <peer>            end a call
  /roster, /stats, /history
  /help, /quit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let mut peer = || {
        words
            .next()
            .map(PeerId::from)
            .ok_or_else(|| format!("/{name} needs a peer id"))
    };

    let command = match name {
        "audio" => Command::ToggleAudio,
        "video" => Command::ToggleVideo,
        "negotiate" => Command::Negotiate,
        "restart" => Command::Restart,
        "call" => Command::Call(peer()?),
        "accept" => Command::Accept(peer()?),
        "reject" => Command::Reject(peer()?),
        "end" => Command::End(peer()?),
        "roster" => Command::Roster,
        "stats" => Command::Stats,
        "history" => Command::History,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "device" => {
            let mut args = rest.split_whitespace().skip(1);
            let kind = match args.next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                _ => return Err("/device needs 'audio' or 'video'".to_string()),
            };
            let device = args.collect::<Vec<_>>().join(" ");
            if device.is_empty() {
                return Err("/device needs a device name".to_string());
            }
            Command::SwitchDevice { kind, device }
        }
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse("  hello there ").unwrap(),
            Some(Command::Chat("hello there".to_string()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_commands_with_peer() {
        assert_eq!(
            parse("/call bob").unwrap(),
            Some(Command::Call(PeerId::from("bob")))
        );
        assert!(parse("/accept").is_err());
    }

    #[test]
    fn test_device_switch() {
        assert_eq!(
            parse("/device video USB Camera").unwrap(),
            Some(Command::SwitchDevice {
                kind: TrackKind::Video,
                device: "USB Camera".to_string(),
            })
        );
        assert!(parse("/device screen x").is_err());
        assert!(parse("/bogus").is_err());
    }
}
