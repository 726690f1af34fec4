//! Mapping from Cortex-M exception state to the signal reported to GDB.

/// Signals used in `S` stop replies. The codes are the fixed two-digit
/// strings GDB clients of this server have always been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Int,
    Ill,
    Trap,
    Bus,
    Segv,
    Stop,
}

impl Signal {
    pub fn code(self) -> &'static str {
        match self {
            Self::Int => "02",
            Self::Ill => "04",
            Self::Trap => "05",
            Self::Bus => "10",
            Self::Segv => "11",
            Self::Stop => "17",
        }
    }

    /// `S<code>` stop reply payload.
    pub fn stop_reply(self) -> String {
        format!("S{}", self.code())
    }
}

/// Active exception, decoded from the low five bits of IPSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Nmi,
    HardFault,
    MemManage,
    BusFault,
    UsageFault,
    Other(u32),
}

/// Mask selecting the exception number from IPSR.
pub const IPSR_EXCEPTION_MASK: u32 = 0x1f;

impl Exception {
    pub fn from_ipsr(ipsr: u32) -> Self {
        match ipsr & IPSR_EXCEPTION_MASK {
            2 => Self::Nmi,
            3 => Self::HardFault,
            4 => Self::MemManage,
            5 => Self::BusFault,
            6 => Self::UsageFault,
            other => Self::Other(other),
        }
    }
}

const FAULT_SIGNALS: [(Exception, Signal); 5] = [
    (Exception::Nmi, Signal::Int),
    (Exception::HardFault, Signal::Segv),
    (Exception::MemManage, Signal::Segv),
    (Exception::BusFault, Signal::Bus),
    (Exception::UsageFault, Signal::Ill),
];

/// Signal reported for a given exception. Anything not in the table,
/// including thread mode, reads as a plain stop.
pub fn signal_for(exception: Exception) -> Signal {
    FAULT_SIGNALS
        .iter()
        .find(|(candidate, _)| *candidate == exception)
        .map_or(Signal::Stop, |&(_, signal)| signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_table() {
        let expected = [
            (2, "02"),
            (3, "11"),
            (4, "11"),
            (5, "10"),
            (6, "04"),
        ];
        for (ipsr, code) in expected {
            assert_eq!(signal_for(Exception::from_ipsr(ipsr)).code(), code, "ipsr {ipsr}");
        }
        for ipsr in [0, 1, 7, 8, 9, 10, 11, 12, 13, 14, 15] {
            assert_eq!(signal_for(Exception::from_ipsr(ipsr)).code(), "17", "ipsr {ipsr}");
        }
    }

    #[test]
    fn test_only_low_bits_select_the_exception() {
        assert_eq!(Exception::from_ipsr(0x0100_0003), Exception::HardFault);
        assert_eq!(Exception::from_ipsr(0x23), Exception::HardFault);
        assert_eq!(Exception::from_ipsr(0x30), Exception::Other(0x10));
    }

    #[test]
    fn test_stop_reply() {
        assert_eq!(Signal::Trap.stop_reply(), "S05");
        assert_eq!(Signal::Stop.stop_reply(), "S17");
    }
}
