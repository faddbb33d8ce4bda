//! Automerge document wrapper for collaborative text editing.
//!
//! A document is a single root Text object (`content`). Every replica starts
//! from the same deterministic genesis change, so replicas created
//! independently (a fresh server process, an offline client) agree on the
//! identity of the text object and their edits merge instead of conflicting.

use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, Value, ROOT,
};
use thiserror::Error;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Document corruption: {0}")]
    Corruption(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Keys used in the Automerge document structure
mod keys {
    pub const CONTENT: &str = "content";
}

/// Every Automerge storage chunk starts with these bytes
const CHUNK_MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];

/// Actor that authors the genesis change on every replica
const GENESIS_ACTOR: &[u8] = b"collab-genesis";

/// Collaborative text document backed by Automerge
pub struct CollabDocument {
    doc: AutoCommit,
}

impl CollabDocument {
    /// Create a new empty document
    pub fn new() -> DocumentResult<Self> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR));
        doc.put_object(ROOT, keys::CONTENT, ObjType::Text)?;
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());
        Ok(Self { doc })
    }

    /// Load a document from its full-state encoding
    pub fn load(data: &[u8]) -> DocumentResult<Self> {
        let doc = AutoCommit::load(data)?;
        Ok(Self { doc })
    }

    /// Encode the full document state
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Encode changes made locally since the last save or update
    #[cfg(test)]
    pub fn take_update(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Cheap framing check before any decoding work.
    fn check_header(update: &[u8]) -> DocumentResult<()> {
        if update.is_empty() {
            return Err(DocumentError::MalformedUpdate("empty update".into()));
        }
        if !update.starts_with(&CHUNK_MAGIC) {
            return Err(DocumentError::MalformedUpdate(
                "missing automerge chunk header".into(),
            ));
        }
        Ok(())
    }

    /// Merge a remote update, all or nothing.
    ///
    /// `load_incremental` applies the changes of a frame one at a time, so a
    /// frame whose later change conflicts with the live state (a reused
    /// actor sequence number, say) would leave its earlier changes behind.
    /// The frame is therefore applied to a fork and the fork replaces the
    /// live replica only when every change went in.
    pub fn apply_update(&mut self, update: &[u8]) -> DocumentResult<usize> {
        Self::check_header(update)?;

        let actor = self.doc.get_actor().clone();
        let mut candidate = self.doc.fork();
        candidate.set_actor(actor);

        let applied = candidate
            .load_incremental(update)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        self.doc = candidate;
        Ok(applied)
    }

    /// Current heads (the document's state vector)
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Encode everything a peer at `heads` is missing.
    ///
    /// Unknown hashes are ignored; a peer with no known heads gets the full
    /// state encoding.
    pub fn changes_since(&mut self, heads: &[ChangeHash]) -> Vec<u8> {
        let mut known = Vec::with_capacity(heads.len());
        for hash in heads {
            if self.doc.get_change_by_hash(hash).is_some() {
                known.push(*hash);
            }
        }
        if known.is_empty() {
            return self.save();
        }

        let mut out = Vec::new();
        for change in self.doc.get_changes(&known) {
            out.extend_from_slice(change.raw_bytes());
        }
        out
    }

    fn content_id(&self) -> DocumentResult<ObjId> {
        match self.doc.get(ROOT, keys::CONTENT)? {
            Some((Value::Object(ObjType::Text), id)) => Ok(id),
            _ => Err(DocumentError::Corruption("Missing content text".into())),
        }
    }

    /// Plain-text projection of the document
    pub fn text(&self) -> DocumentResult<String> {
        let id = self.content_id()?;
        Ok(self.doc.text(&id)?)
    }

    /// Text mirror for storage; a document without a content object mirrors
    /// as empty text.
    pub fn text_mirror(&self) -> String {
        self.text().unwrap_or_default()
    }

    /// Splice the content text (local edit)
    #[cfg(test)]
    pub fn splice_text(
        &mut self,
        position: usize,
        delete_count: usize,
        insert_text: &str,
    ) -> DocumentResult<()> {
        let id = self.content_id()?;
        self.doc
            .splice_text(&id, position, delete_count as isize, insert_text)?;
        Ok(())
    }
}

#[cfg(test)]
impl CollabDocument {
    /// Empty document whose local edits are authored by `actor`
    pub(crate) fn with_actor(actor: &[u8]) -> Self {
        let mut doc = Self::new().expect("genesis document");
        doc.doc.set_actor(ActorId::from(actor));
        doc
    }
}

/// Heads travel on the wire as raw 32-byte hashes
pub fn heads_to_bytes(heads: &[ChangeHash]) -> Vec<[u8; 32]> {
    heads.iter().map(|h| h.0).collect()
}

pub fn heads_from_bytes(heads: &[[u8; 32]]) -> Vec<ChangeHash> {
    heads.iter().map(|h| ChangeHash(*h)).collect()
}
