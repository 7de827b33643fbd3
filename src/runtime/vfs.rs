use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An in-memory file: a growable buffer plus the committed length.
#[derive(Debug)]
pub struct VirtualFile {
    pub buffer: Vec<u8>,
    pub size: usize,
    pub mtime: u64,
}

impl VirtualFile {
    fn new() -> Self {
        VirtualFile {
            buffer: Vec::new(),
            size: 0,
            mtime: now_secs(),
        }
    }

    /// Writes at `cursor`, growing the buffer by doubling, and returns the
    /// number of bytes written. `size` only ever grows.
    pub fn write_at(&mut self, cursor: usize, bytes: &[u8]) -> usize {
        let end = cursor + bytes.len();
        if end > self.buffer.len() {
            let mut capacity = self.buffer.len().max(64);
            while capacity < end {
                capacity *= 2;
            }
            self.buffer.resize(capacity, 0);
        }
        self.buffer[cursor..end].copy_from_slice(bytes);
        self.size = self.size.max(end);
        self.mtime = now_secs();
        bytes.len()
    }

    /// Reads up to `n` bytes from `cursor`; empty at or past EOF.
    pub fn read_at(&self, cursor: usize, n: usize) -> &[u8] {
        if cursor >= self.size {
            return &[];
        }
        let end = (cursor + n).min(self.size);
        &self.buffer[cursor..end]
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An open file: either a real host file or a cursor into a VirtualFile.
pub enum Handle {
    Host(std::fs::File),
    Virtual {
        file: Rc<RefCell<VirtualFile>>,
        cursor: usize,
        mode: String,
    },
}

/// The handle table plus the in-memory file store.
///
/// Handles are numbered monotonically from 3; 0/1/2 are reserved for the
/// standard streams. With `ramfs` set, every open lands in the in-memory
/// store regardless of what the host filesystem holds.
pub struct Vfs {
    files: HashMap<String, Rc<RefCell<VirtualFile>>>,
    handles: HashMap<i32, Handle>,
    next_handle: i32,
    ramfs: bool,
}

impl Vfs {
    pub fn new(ramfs: bool) -> Self {
        Vfs {
            files: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 3,
            ramfs,
        }
    }

    /// fopen. Returns the new handle, or 0 on failure (`r` on a missing
    /// file).
    pub fn open(&mut self, path: &str, mode: &str) -> i32 {
        if !self.ramfs {
            if let Some(file) = open_host(path, mode) {
                return self.insert(Handle::Host(file));
            }
            return 0;
        }

        let writing = mode.contains('w');
        let appending = mode.contains('a');

        let file = match self.files.get(path) {
            Some(file) if !writing => Rc::clone(file),
            Some(file) => {
                // w truncates in place so aliased handles see the new
                // contents.
                let mut f = file.borrow_mut();
                f.buffer.clear();
                f.size = 0;
                drop(f);
                Rc::clone(file)
            }
            None if writing || appending => {
                let file = Rc::new(RefCell::new(VirtualFile::new()));
                self.files.insert(path.to_string(), Rc::clone(&file));
                file
            }
            None => return 0,
        };

        let cursor = if appending { file.borrow().size } else { 0 };
        self.insert(Handle::Virtual {
            file,
            cursor,
            mode: mode.to_string(),
        })
    }

    fn insert(&mut self, handle: Handle) -> i32 {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, handle);
        id
    }

    /// Writes through a handle, advancing its cursor. Returns bytes
    /// written, or 0 for an unknown handle.
    pub fn write(&mut self, handle: i32, bytes: &[u8]) -> usize {
        match self.handles.get_mut(&handle) {
            Some(Handle::Host(file)) => file.write(bytes).unwrap_or(0),
            Some(Handle::Virtual { file, cursor, .. }) => {
                let n = file.borrow_mut().write_at(*cursor, bytes);
                *cursor += n;
                n
            }
            None => 0,
        }
    }

    /// Reads up to `n` bytes through a handle, advancing its cursor.
    pub fn read(&mut self, handle: i32, n: usize) -> Vec<u8> {
        match self.handles.get_mut(&handle) {
            Some(Handle::Host(file)) => {
                let mut buf = vec![0u8; n];
                let got = file.read(&mut buf).unwrap_or(0);
                buf.truncate(got);
                buf
            }
            Some(Handle::Virtual { file, cursor, .. }) => {
                let f = file.borrow();
                let data = f.read_at(*cursor, n).to_vec();
                drop(f);
                *cursor += data.len();
                data
            }
            None => Vec::new(),
        }
    }

    pub fn close(&mut self, handle: i32) -> bool {
        self.handles.remove(&handle).is_some()
    }

    /// Called on VM halt: every outstanding handle is dropped.
    pub fn flush_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let Handle::Host(mut file) = handle {
                let _ = file.flush();
            }
        }
    }

    /// The committed contents of an in-memory file, for host inspection.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|f| {
            let f = f.borrow();
            f.buffer[..f.size].to_vec()
        })
    }
}

fn open_host(path: &str, mode: &str) -> Option<std::fs::File> {
    let mut options = OpenOptions::new();
    if mode.contains('w') {
        options.write(true).create(true).truncate(true);
    } else if mode.contains('a') {
        options.append(true).create(true);
    } else {
        options.read(true);
    }
    if mode.contains('+') {
        options.read(true).write(true);
    }
    let mut file = options.open(path).ok()?;
    if mode.contains('a') {
        let _ = file.seek(SeekFrom::End(0));
    }
    Some(file)
}
