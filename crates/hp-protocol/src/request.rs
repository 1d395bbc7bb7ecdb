//! Request verbs issued by the gateway (or a local command client)
//!
//! Observed dialog, request on the left, boiler reply indented:
//!
//! ```text
//! $login token              $00A000A0
//! $login key <hex>          zclient login (n) / $ack
//! $apiversion               $1.0.1
//! $setkomm                  $1234567 ack
//! $asnr get                 $<asnr>
//! $igw set 1234567          $ack
//! $igw clear                $ack            (gateway is leaving)
//! $dhcp renew               $ack
//! $daq stop | start         $daq stopped | $daq started
//! $logging disable | enable $logging disabled | $logging enabled
//! $daq desc                 $<<<DAQPRJ> ... >>
//! $bootversion              $V2.18
//! $info                     $KT: ... $SWV: ... $FWV I/O: ... $SN I/O: ... $SN BCE: ...
//! $uptime                   $<seconds>
//! $rtc get                  $YYYY-MM-DD HH:MM:SS
//! $par get all | changed    $<record> ... | $--
//! $par get PR001            $PR001;6;2;4;1;0;0;0;Mode;Manu;Arr;Ballon;Auto;...
//! $par set "PR001;6;1"      zPa A: ... / zPa N: PR001 (Mode) = Arr / $ack
//! $erract                   $no errors
//! ```

use serde::Serialize;
use std::fmt;

/// Classified request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestVerb {
    LoginToken,
    LoginKey,
    ApiVersion,
    SetKomm,
    AsnrGet,
    IgwSet,
    /// The gateway clears its registration; the session is over once acked
    IgwClear,
    /// The gateway asks the boiler to renew its network address
    DhcpRenew,
    DaqStop,
    DaqDesc,
    DaqStart,
    LoggingDisable,
    LoggingEnable,
    BootVersion,
    Info,
    Uptime,
    RtcGet,
    ParGetAll,
    ParGetChanged,
    ParGet,
    ParSet,
    ErrAct,
    /// Unknown verb, relayed untouched
    Passthrough,
}

/// Prefix table, longest match first where prefixes overlap
const VERB_PREFIXES: &[(&str, RequestVerb)] = &[
    ("$login token", RequestVerb::LoginToken),
    ("$login key", RequestVerb::LoginKey),
    ("$apiversion", RequestVerb::ApiVersion),
    ("$setkomm", RequestVerb::SetKomm),
    ("$asnr get", RequestVerb::AsnrGet),
    ("$igw set", RequestVerb::IgwSet),
    ("$igw clear", RequestVerb::IgwClear),
    ("$dhcp renew", RequestVerb::DhcpRenew),
    ("$daq stop", RequestVerb::DaqStop),
    ("$daq desc", RequestVerb::DaqDesc),
    ("$daq start", RequestVerb::DaqStart),
    ("$logging disable", RequestVerb::LoggingDisable),
    ("$logging enable", RequestVerb::LoggingEnable),
    ("$bootversion", RequestVerb::BootVersion),
    ("$info", RequestVerb::Info),
    ("$uptime", RequestVerb::Uptime),
    ("$rtc get", RequestVerb::RtcGet),
    ("$par get all", RequestVerb::ParGetAll),
    ("$par get changed", RequestVerb::ParGetChanged),
    ("$par get", RequestVerb::ParGet),
    ("$par set", RequestVerb::ParSet),
    ("$erract", RequestVerb::ErrAct),
];

impl RequestVerb {
    /// Classify a request line (terminator already stripped).
    ///
    /// Returns the verb and the argument text following the verb prefix.
    pub fn classify(line: &str) -> (Self, &str) {
        VERB_PREFIXES
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix))
            .map(|(prefix, verb)| (*verb, line[prefix.len()..].trim()))
            .unwrap_or((RequestVerb::Passthrough, line))
    }

    /// Protocol spelling of the verb
    pub fn as_str(&self) -> &'static str {
        VERB_PREFIXES
            .iter()
            .find(|(_, verb)| verb == self)
            .map(|(prefix, _)| *prefix)
            .unwrap_or("passthrough")
    }

    /// Whether an acknowledgement of this verb ends the gateway session
    pub fn ends_session(&self) -> bool {
        matches!(self, RequestVerb::IgwClear)
    }
}

impl fmt::Display for RequestVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_overlapping_prefixes() {
        assert_eq!(RequestVerb::classify("$par get all").0, RequestVerb::ParGetAll);
        assert_eq!(
            RequestVerb::classify("$par get changed \"2024-01-01 00:00:00\"").0,
            RequestVerb::ParGetChanged
        );
        assert_eq!(RequestVerb::classify("$par get PR001"), (RequestVerb::ParGet, "PR001"));
        assert_eq!(RequestVerb::classify("$igw set 1234567"), (RequestVerb::IgwSet, "1234567"));
        assert_eq!(RequestVerb::classify("$igw clear").0, RequestVerb::IgwClear);
    }

    #[test]
    fn test_classify_unknown_is_passthrough() {
        let (verb, arg) = RequestVerb::classify("$frobnicate 3");
        assert_eq!(verb, RequestVerb::Passthrough);
        assert_eq!(arg, "$frobnicate 3");
    }

    #[test]
    fn test_session_clear_verb() {
        assert!(RequestVerb::IgwClear.ends_session());
        assert!(!RequestVerb::DhcpRenew.ends_session());
        assert_eq!(RequestVerb::IgwClear.to_string(), "$igw clear");
    }
}
