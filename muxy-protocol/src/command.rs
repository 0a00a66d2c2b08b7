use crate::ascii::StoreVerb;
use crate::binary::opcode;

/// Binary encoding recipe for one ASCII command: the opcode, its quiet
/// twin (used under `noreply`), and the extras length the opcode
/// requires on requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinarySpec {
    pub opcode: u8,
    pub quiet: u8,
    pub ext_len: u8,
}

/// The a2b table for storage verbs. `cas` rides the binary SET header's
/// cas field, so it shares SET's opcodes.
pub fn store_spec(verb: StoreVerb) -> BinarySpec {
    match verb {
        StoreVerb::Set | StoreVerb::Cas => {
            BinarySpec { opcode: opcode::SET, quiet: opcode::SETQ, ext_len: 8 }
        }
        StoreVerb::Add => BinarySpec { opcode: opcode::ADD, quiet: opcode::ADDQ, ext_len: 8 },
        StoreVerb::Replace => {
            BinarySpec { opcode: opcode::REPLACE, quiet: opcode::REPLACEQ, ext_len: 8 }
        }
        StoreVerb::Append => {
            BinarySpec { opcode: opcode::APPEND, quiet: opcode::APPENDQ, ext_len: 0 }
        }
        StoreVerb::Prepend => {
            BinarySpec { opcode: opcode::PREPEND, quiet: opcode::PREPENDQ, ext_len: 0 }
        }
    }
}

/// Quiet twin of an opcode, or the opcode itself when none exists.
pub fn quiet_variant(op: u8) -> u8 {
    match op {
        opcode::GET => opcode::GETQ,
        opcode::GETK => opcode::GETKQ,
        opcode::SET => opcode::SETQ,
        opcode::ADD => opcode::ADDQ,
        opcode::REPLACE => opcode::REPLACEQ,
        opcode::DELETE => opcode::DELETEQ,
        opcode::INCREMENT => opcode::INCREMENTQ,
        opcode::DECREMENT => opcode::DECREMENTQ,
        opcode::QUIT => opcode::QUITQ,
        opcode::FLUSH => opcode::FLUSHQ,
        opcode::APPEND => opcode::APPENDQ,
        opcode::PREPEND => opcode::PREPENDQ,
        other => other,
    }
}

/// Loud twin of a quiet opcode, or the opcode itself.
pub fn loud_variant(op: u8) -> u8 {
    match op {
        opcode::GETQ => opcode::GET,
        opcode::GETKQ => opcode::GETK,
        opcode::SETQ => opcode::SET,
        opcode::ADDQ => opcode::ADD,
        opcode::REPLACEQ => opcode::REPLACE,
        opcode::DELETEQ => opcode::DELETE,
        opcode::INCREMENTQ => opcode::INCREMENT,
        opcode::DECREMENTQ => opcode::DECREMENT,
        opcode::QUITQ => opcode::QUIT,
        opcode::FLUSHQ => opcode::FLUSH,
        opcode::APPENDQ => opcode::APPEND,
        opcode::PREPENDQ => opcode::PREPEND,
        other => other,
    }
}

/// Quiet opcodes never get a success reply; the backend answers only on
/// error (and GETQ/GETKQ answer only on hit).
pub fn is_quiet(op: u8) -> bool {
    loud_variant(op) != op
}

/// Binary commands that fan out to every backend.
pub fn is_broadcast(op: u8) -> bool {
    matches!(
        loud_variant(op),
        opcode::FLUSH | opcode::STAT | opcode::VERSION | opcode::NOOP | opcode::VERBOSITY
    )
}

/// Commands the proxy refuses to forward: upstream SASL is not proxied,
/// and unknown opcodes never touch a downstream.
pub fn is_forwardable(op: u8) -> bool {
    !matches!(op, opcode::SASL_LIST_MECHS | opcode::SASL_AUTH | opcode::SASL_STEP)
        && known_opcode(op)
}

fn known_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::GET
            | opcode::SET
            | opcode::ADD
            | opcode::REPLACE
            | opcode::DELETE
            | opcode::INCREMENT
            | opcode::DECREMENT
            | opcode::QUIT
            | opcode::FLUSH
            | opcode::GETQ
            | opcode::NOOP
            | opcode::VERSION
            | opcode::GETK
            | opcode::GETKQ
            | opcode::APPEND
            | opcode::PREPEND
            | opcode::STAT
            | opcode::SETQ
            | opcode::ADDQ
            | opcode::REPLACEQ
            | opcode::DELETEQ
            | opcode::INCREMENTQ
            | opcode::DECREMENTQ
            | opcode::QUITQ
            | opcode::FLUSHQ
            | opcode::APPENDQ
            | opcode::PREPENDQ
            | opcode::VERBOSITY
            | opcode::TOUCH
            | opcode::SELECT_BUCKET
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_spec_table() {
        assert_eq!(store_spec(StoreVerb::Set).opcode, opcode::SET);
        assert_eq!(store_spec(StoreVerb::Set).quiet, opcode::SETQ);
        assert_eq!(store_spec(StoreVerb::Set).ext_len, 8);
        assert_eq!(store_spec(StoreVerb::Cas).opcode, opcode::SET);
        assert_eq!(store_spec(StoreVerb::Append).ext_len, 0);
        assert_eq!(store_spec(StoreVerb::Prepend).quiet, opcode::PREPENDQ);
    }

    #[test]
    fn test_quiet_loud_are_inverses() {
        for op in [
            opcode::GET,
            opcode::GETK,
            opcode::SET,
            opcode::ADD,
            opcode::REPLACE,
            opcode::DELETE,
            opcode::INCREMENT,
            opcode::DECREMENT,
            opcode::FLUSH,
            opcode::APPEND,
            opcode::PREPEND,
        ] {
            let q = quiet_variant(op);
            assert_ne!(q, op, "opcode {op:#x} has a quiet twin");
            assert_eq!(loud_variant(q), op);
        }
    }

    #[test]
    fn test_is_quiet() {
        assert!(is_quiet(opcode::SETQ));
        assert!(is_quiet(opcode::GETKQ));
        assert!(!is_quiet(opcode::SET));
        assert!(!is_quiet(opcode::NOOP));
    }

    #[test]
    fn test_broadcast_classification() {
        assert!(is_broadcast(opcode::FLUSH));
        assert!(is_broadcast(opcode::FLUSHQ));
        assert!(is_broadcast(opcode::STAT));
        assert!(is_broadcast(opcode::VERSION));
        assert!(is_broadcast(opcode::NOOP));
        assert!(!is_broadcast(opcode::GET));
        assert!(!is_broadcast(opcode::SET));
    }

    #[test]
    fn test_sasl_not_forwardable() {
        assert!(!is_forwardable(opcode::SASL_AUTH));
        assert!(!is_forwardable(opcode::SASL_LIST_MECHS));
        assert!(!is_forwardable(opcode::SASL_STEP));
        assert!(is_forwardable(opcode::GET));
        assert!(!is_forwardable(0x7f), "unknown opcode refused");
    }
}
