//! The synthetic guest program.
//!
//! The guest exists to produce controlled exit events, so it is a short
//! script of operations rather than real machine code. Each operation
//! carries the encoded length of the instruction sequence it stands for;
//! the simulated processor resolves the guest instruction pointer to an
//! operation by its offset from the entry point, and every memory access an
//! operation makes goes through the full two-stage translation.

use visor::addressing::Va;

/// The function under interception: `mov al, 0xAA; ret`.
pub const TARGET_FUNCTION: [u8; 3] = [0xB0, 0xAA, 0xC3];
/// The replacement function: `mov al, 0xBB; ret`.
pub const HOOK_FUNCTION: [u8; 3] = [0xB0, 0xBB, 0xC3];
/// The status byte for a guest that detected tampering.
pub const STATUS_ABORTED: u8 = 0xCC;
/// Bytes the guest reserves on its stack before the first halt.
pub const FRAME_SIZE: usize = 0x30;

/// One scripted guest operation.
#[derive(Debug, Clone, Copy)]
pub enum GuestOp {
    /// `sub rsp, imm8`.
    OpenFrame(usize),
    /// `hlt`.
    Hlt,
    /// Read the function image at the address and remember it.
    SnapshotFunction(Va),
    /// Call through the function pointer; the returned value lands in `al`.
    CallFunction(Va),
    /// Re-read the function image and compare against the snapshot.
    VerifyFunction(Va),
    /// Store the status byte into the reserved stack slot.
    StoreStatus,
}

impl GuestOp {
    /// Encoded length of the instruction sequence this operation stands for.
    pub fn encoded_len(&self) -> usize {
        match self {
            GuestOp::OpenFrame(_) => 4,
            GuestOp::Hlt => 1,
            GuestOp::SnapshotFunction(_) | GuestOp::VerifyFunction(_) => 7,
            GuestOp::CallFunction(_) => 5,
            GuestOp::StoreStatus => 7,
        }
    }
}

/// The scripted guest: its operations, laid out from the entry point, and
/// the little register state the script touches.
pub struct GuestProgram {
    entry: Va,
    ops: Vec<(usize, GuestOp)>,
    /// The guest's `al` register.
    pub al: u8,
    /// The function image remembered by [`GuestOp::SnapshotFunction`].
    pub saved: Option<[u8; 3]>,
    /// Whether [`GuestOp::VerifyFunction`] observed a modified image.
    pub tampered: bool,
}

impl GuestProgram {
    /// Lay a script out from `entry`.
    pub fn new(entry: Va, script: Vec<GuestOp>) -> Self {
        let mut ops = Vec::with_capacity(script.len());
        let mut offset = 0;
        for op in script {
            ops.push((offset, op));
            offset += op.encoded_len();
        }
        Self {
            entry,
            ops,
            al: 0,
            saved: None,
            tampered: false,
        }
    }

    /// A guest that opens its frame and halts once.
    pub fn halt_only(entry: Va) -> Self {
        Self::new(entry, vec![GuestOp::OpenFrame(FRAME_SIZE), GuestOp::Hlt])
    }

    /// A guest that halts, calls through `target`, stores its status, and
    /// halts again.
    pub fn call_through(entry: Va, target: Va) -> Self {
        Self::new(
            entry,
            vec![
                GuestOp::OpenFrame(FRAME_SIZE),
                GuestOp::Hlt,
                GuestOp::CallFunction(target),
                GuestOp::StoreStatus,
                GuestOp::Hlt,
            ],
        )
    }

    /// A guest that additionally snapshots the target image before the call
    /// and verifies it afterward, aborting if the bytes changed.
    pub fn checked_call(entry: Va, target: Va) -> Self {
        Self::new(
            entry,
            vec![
                GuestOp::OpenFrame(FRAME_SIZE),
                GuestOp::Hlt,
                GuestOp::SnapshotFunction(target),
                GuestOp::CallFunction(target),
                GuestOp::VerifyFunction(target),
                GuestOp::StoreStatus,
                GuestOp::Hlt,
            ],
        )
    }

    /// The guest entry point.
    pub fn entry(&self) -> Va {
        self.entry
    }

    /// The operation whose encoding starts exactly at `rip`.
    pub fn op_at(&self, rip: usize) -> Option<GuestOp> {
        let delta = rip.checked_sub(unsafe { self.entry.into_usize() })?;
        self.ops
            .iter()
            .find(|(offset, _)| *offset == delta)
            .map(|(_, op)| *op)
    }

    /// The status byte the guest deposits on its stack.
    pub fn status_byte(&self) -> u8 {
        if self.tampered {
            STATUS_ABORTED
        } else {
            self.al
        }
    }

    /// Interpret a fetched function image: `mov al, imm8; ret` yields the
    /// immediate.
    pub fn decode_return(image: [u8; 3]) -> u8 {
        if image[0] == 0xB0 && image[2] == 0xC3 {
            image[1]
        } else {
            log::warn!("guest called through an unrecognized function image {:02x?}", image);
            0
        }
    }
}
