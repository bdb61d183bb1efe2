use stackmark_trace_types::{FrameKey, InvariantError, ModulePath, StackFingerprint, WalkMode};
use std::error::Error;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;

/// Hard cap on the number of frames any walk collects.
pub const MAX_STACK_DEPTH: usize = 2048;
pub const DEFAULT_STACK_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub max_frames: NonZeroUsize,
    pub skip_frames: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_frames: NonZeroUsize::new(DEFAULT_STACK_DEPTH)
                .expect("invariant violated: default max_frames must be non-zero"),
            skip_frames: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedStack {
    /// Innermost frame first.
    pub frames: Vec<FrameKey>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub path: ModulePath,
    pub runtime_base: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceCapabilities {
    pub unwinding_supported: bool,
    pub module_resolution_supported: bool,
}

#[derive(Debug)]
pub enum CaptureError {
    UnsupportedPlatform { target_os: &'static str },
    EmptyBacktrace,
    MissingModuleInfo { ip: u64 },
    MissingModulePath { ip: u64 },
    ZeroModuleBase { ip: u64 },
    IpBeforeModuleBase { ip: u64, module_base: u64 },
    InvariantViolation {
        context: &'static str,
        source: InvariantError,
    },
}

impl CaptureError {
    fn invariant(context: &'static str, source: InvariantError) -> Self {
        Self::InvariantViolation { context, source }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedPlatform { target_os } => {
                write!(f, "unsupported platform: {target_os}")
            }
            Self::EmptyBacktrace => write!(f, "stack walk produced no frames"),
            Self::MissingModuleInfo { ip } => {
                write!(f, "dladdr returned no module info for ip=0x{ip:x}")
            }
            Self::MissingModulePath { ip } => {
                write!(f, "module path is missing for ip=0x{ip:x}")
            }
            Self::ZeroModuleBase { ip } => {
                write!(f, "module base is zero for ip=0x{ip:x}")
            }
            Self::IpBeforeModuleBase { ip, module_base } => write!(
                f,
                "instruction pointer 0x{ip:x} is below module base 0x{module_base:x}"
            ),
            Self::InvariantViolation { context, source } => {
                write!(f, "invariant violated in {context}: {source}")
            }
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvariantViolation { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub fn trace_capabilities() -> TraceCapabilities {
    TraceCapabilities {
        unwinding_supported: cfg!(any(unix, windows)),
        module_resolution_supported: cfg!(any(target_os = "linux", target_os = "macos")),
    }
}

/// Frames the unwinder itself may put on the stack before `walk_current`.
const WALKER_FRAME_BUDGET: usize = 16;

/// Walks the calling thread's stack, innermost frame first.
///
/// The walk starts at the caller of `walk_current`: frames belonging to the
/// unwinder and to this function are dropped, then `skip_frames` more. If the
/// walker's own frame cannot be located by address, nothing beyond
/// `skip_frames` is dropped.
#[inline(never)]
pub fn walk_current(options: WalkOptions) -> Result<WalkedStack, CaptureError> {
    if !trace_capabilities().unwinding_supported {
        return Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        });
    }

    let max_frames = options.max_frames.get().min(MAX_STACK_DEPTH);
    let anchor = walk_current as fn(WalkOptions) -> Result<WalkedStack, CaptureError> as usize;
    let limit = WALKER_FRAME_BUDGET
        .saturating_add(options.skip_frames)
        .saturating_add(max_frames)
        .saturating_add(1);
    let mut raw = Vec::with_capacity(limit.min(WALKER_FRAME_BUDGET + DEFAULT_STACK_DEPTH));
    let mut walker_end = None;

    backtrace::trace(|frame| {
        if walker_end.is_none()
            && raw.len() < WALKER_FRAME_BUDGET
            && frame.symbol_address() as usize == anchor
        {
            walker_end = Some(raw.len() + 1);
        }
        raw.push(FrameKey {
            ip: frame.ip() as usize as u64,
        });
        raw.len() < limit
    });

    let start = walker_end
        .unwrap_or(0)
        .saturating_add(options.skip_frames)
        .min(raw.len());
    let mut frames = raw.split_off(start);
    let truncated = frames.len() > max_frames;
    frames.truncate(max_frames);

    if frames.is_empty() {
        return Err(CaptureError::EmptyBacktrace);
    }

    Ok(WalkedStack { frames, truncated })
}

/// Hashes a walked stack together with the mode it was walked under, so that
/// the same frames captured in different modes never share a fingerprint.
pub fn fingerprint_frames(
    frames: &[FrameKey],
    mode: WalkMode,
    truncated: bool,
) -> StackFingerprint {
    let mut hasher = DefaultHasher::new();
    mode.as_u8().hash(&mut hasher);
    truncated.hash(&mut hasher);
    frames.hash(&mut hasher);
    StackFingerprint::new(hasher.finish())
}

/// Finds the loaded module that contains `ip`.
pub fn resolve_module(ip: u64) -> Result<ResolvedModule, CaptureError> {
    let raw = platform::module_info_for_ip(ip)?;
    if ip < raw.runtime_base {
        return Err(CaptureError::IpBeforeModuleBase {
            ip,
            module_base: raw.runtime_base,
        });
    }
    let path = ModulePath::new(raw.path)
        .map_err(|err| CaptureError::invariant("module_path", err))?;
    Ok(ResolvedModule {
        path,
        runtime_base: raw.runtime_base,
    })
}

struct RawModuleInfo {
    runtime_base: u64,
    path: String,
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod platform {
    use super::{CaptureError, RawModuleInfo};
    use std::ffi::{CStr, c_void};

    pub(super) fn module_info_for_ip(ip: u64) -> Result<RawModuleInfo, CaptureError> {
        let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
        let ok = unsafe { libc::dladdr(ip as usize as *const c_void, info.as_mut_ptr()) };
        if ok == 0 {
            return Err(CaptureError::MissingModuleInfo { ip });
        }

        let info = unsafe { info.assume_init() };
        if info.dli_fbase.is_null() {
            return Err(CaptureError::ZeroModuleBase { ip });
        }
        let runtime_base = info.dli_fbase as usize as u64;

        if info.dli_fname.is_null() {
            return Err(CaptureError::MissingModulePath { ip });
        }

        let path = unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned();
        if path.is_empty() {
            return Err(CaptureError::MissingModulePath { ip });
        }

        Ok(RawModuleInfo { runtime_base, path })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    use super::{CaptureError, RawModuleInfo};

    pub(super) fn module_info_for_ip(_ip: u64) -> Result<RawModuleInfo, CaptureError> {
        Err(CaptureError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }
}
