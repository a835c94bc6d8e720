use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::buffer::BufferStore;
use crate::errors::{NodeError, NodeResult};
use crate::hash::H32;
use crate::ledger::{
    shard_no, LedgerRecord, LedgerUserInput, LedgerUserOutput, PRIMARY_SHARD_SIZE, RAW_SHARD_SIZE,
};

const PRIMARY_DB: &str = "ledger.sqlite";
const RAW_DB: &str = "raw.sqlite";
const RAW_BLOBS: &str = "raw.blobs";

const CREATE_LEDGER_TABLE: &str = "CREATE TABLE IF NOT EXISTS ledger (\
    seq_no INT PRIMARY KEY NOT NULL, time INT NOT NULL, ledger_hash BLOB NOT NULL,\
    prev_ledger_hash BLOB NOT NULL, data_hash BLOB NOT NULL, state_hash BLOB NOT NULL,\
    config_hash BLOB NOT NULL, nonce BLOB NOT NULL, user_hash BLOB NOT NULL,\
    input_hash BLOB NOT NULL, output_hash BLOB NOT NULL)";
const CREATE_HP_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS hp (ledger_version TEXT NOT NULL)";
const INSERT_LEDGER: &str = "INSERT INTO ledger(\
    seq_no, time, ledger_hash, prev_ledger_hash, data_hash, state_hash, config_hash,\
    nonce, user_hash, input_hash, output_hash) VALUES(?,?,?,?,?,?,?,?,?,?,?)";
const SELECT_LAST_LEDGER: &str = "SELECT * FROM ledger ORDER BY seq_no DESC LIMIT 1";
const SELECT_LEDGER_BY_SEQ_NO: &str = "SELECT * FROM ledger WHERE seq_no=? LIMIT 1";

const CREATE_USERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS users (\
    ledger_seq_no INT NOT NULL, pubkey BLOB NOT NULL)";
const CREATE_INPUTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS inputs (\
    ledger_seq_no INT NOT NULL, pubkey BLOB NOT NULL, hash BLOB NOT NULL,\
    nonce INT NOT NULL, blob_offset INT NOT NULL, blob_size INT NOT NULL)";
const CREATE_OUTPUTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS outputs (\
    ledger_seq_no INT NOT NULL, pubkey BLOB NOT NULL, hash BLOB NOT NULL,\
    blob_offset INT NOT NULL, blob_count INT NOT NULL)";

/// One user's input payload queued for raw-shard persistence.
#[derive(Clone, Debug)]
pub struct RawInput {
    pub pubkey: Vec<u8>,
    pub hash: H32,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

/// One user's output buffers of a round.
#[derive(Clone, Debug)]
pub struct RawOutput {
    pub pubkey: Vec<u8>,
    pub hash: H32,
    pub outputs: Vec<Vec<u8>>,
}

/// Everything the raw shard stores for a round, alongside the primary row.
#[derive(Clone, Debug, Default)]
pub struct RoundRawData {
    pub users: Vec<Vec<u8>>,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
}

impl RoundRawData {
    fn is_empty(&self) -> bool {
        self.users.is_empty() && self.inputs.is_empty() && self.outputs.is_empty()
    }
}

/// Hash-chained ledger records in SQLite shards: one database per
/// contiguous block of seq numbers, with an optional raw companion shard
/// holding the full input/output payloads.
pub struct LedgerStore {
    primary_dir: PathBuf,
    raw_dir: Option<PathBuf>,
    journal: bool,
    max_primary_shards: u64,
    max_raw_shards: u64,
    ledger_version: String,
}

impl LedgerStore {
    pub fn open(
        primary_dir: PathBuf,
        raw_dir: Option<PathBuf>,
        journal: bool,
        max_primary_shards: u64,
        max_raw_shards: u64,
        ledger_version: String,
    ) -> NodeResult<Self> {
        fs::create_dir_all(&primary_dir)?;
        if let Some(raw) = &raw_dir {
            fs::create_dir_all(raw)?;
        }
        Ok(Self {
            primary_dir,
            raw_dir,
            journal,
            max_primary_shards,
            max_raw_shards,
            ledger_version,
        })
    }

    pub fn raw_enabled(&self) -> bool {
        self.raw_dir.is_some()
    }

    pub fn last_primary_shard_no(&self) -> NodeResult<Option<u64>> {
        Ok(list_shards(&self.primary_dir)?.last().copied())
    }

    pub fn last_raw_shard_no(&self) -> NodeResult<Option<u64>> {
        match &self.raw_dir {
            Some(dir) => Ok(list_shards(dir)?.last().copied()),
            None => Ok(None),
        }
    }

    /// Appends one committed round. The primary row and any raw rows are
    /// written inside one transaction per database so a failed round leaves
    /// no partial shard content behind.
    pub fn append_round(&self, record: &LedgerRecord, raw: &RoundRawData) -> NodeResult<()> {
        let last = self.get_last_ledger()?;
        if record.seq_no != last.seq_no + 1 || record.prev_ledger_hash != last.ledger_hash {
            return Err(NodeError::LedgerIntegrityViolation(format!(
                "record {} does not extend tip {}",
                record.seq_no, last.seq_no
            )));
        }

        let shard = shard_no(record.seq_no, PRIMARY_SHARD_SIZE);
        let mut conn = self.open_primary(shard, true)?;
        let tx = conn.transaction()?;
        tx.execute(
            INSERT_LEDGER,
            params![
                record.seq_no as i64,
                record.timestamp as i64,
                record.ledger_hash.as_bytes(),
                record.prev_ledger_hash.as_bytes(),
                record.data_hash.as_bytes(),
                record.state_hash.as_bytes(),
                record.config_hash.as_bytes(),
                record.nonce.as_bytes(),
                record.user_hash.as_bytes(),
                record.input_hash.as_bytes(),
                record.output_hash.as_bytes(),
            ],
        )?;
        tx.commit()?;

        if let Some(raw_dir) = &self.raw_dir {
            if !raw.is_empty() {
                self.append_raw_round(raw_dir, record.seq_no, raw)?;
            }
        }

        self.prune_shards()?;
        Ok(())
    }

    fn append_raw_round(&self, raw_dir: &Path, seq_no: u64, raw: &RoundRawData) -> NodeResult<()> {
        let shard = shard_no(seq_no, RAW_SHARD_SIZE);
        let shard_dir = raw_dir.join(shard.to_string());
        fs::create_dir_all(&shard_dir)?;
        let mut blobs = BufferStore::open(&shard_dir.join(RAW_BLOBS))?;
        let mut conn = self.open_raw(shard)?;
        let tx = conn.transaction()?;
        for user in &raw.users {
            tx.execute(
                "INSERT INTO users(ledger_seq_no, pubkey) VALUES(?,?)",
                params![seq_no as i64, user],
            )?;
        }
        for input in &raw.inputs {
            let view = blobs.write_buf(&input.payload)?;
            tx.execute(
                "INSERT INTO inputs(ledger_seq_no, pubkey, hash, nonce, blob_offset, blob_size)\
                 VALUES(?,?,?,?,?,?)",
                params![
                    seq_no as i64,
                    input.pubkey,
                    input.hash.as_bytes(),
                    input.nonce as i64,
                    view.offset,
                    view.size,
                ],
            )?;
        }
        for output in &raw.outputs {
            let mut joined = Vec::new();
            for buf in &output.outputs {
                joined.extend_from_slice(&(buf.len() as u32).to_le_bytes());
                joined.extend_from_slice(buf);
            }
            let view = blobs.write_buf(&joined)?;
            tx.execute(
                "INSERT INTO outputs(ledger_seq_no, pubkey, hash, blob_offset, blob_count)\
                 VALUES(?,?,?,?,?)",
                params![
                    seq_no as i64,
                    output.pubkey,
                    output.hash.as_bytes(),
                    view.offset,
                    output.outputs.len() as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Latest committed record, or the genesis record when no shard holds
    /// any rows yet.
    pub fn get_last_ledger(&self) -> NodeResult<LedgerRecord> {
        let shards = list_shards(&self.primary_dir)?;
        for shard in shards.iter().rev() {
            let conn = self.open_primary(*shard, false)?;
            let record = conn
                .query_row(SELECT_LAST_LEDGER, [], row_to_record)
                .optional()?;
            if let Some(record) = record {
                return Ok(record);
            }
        }
        Ok(LedgerRecord::genesis())
    }

    pub fn get_ledger_by_seq_no(&self, seq_no: u64) -> NodeResult<Option<LedgerRecord>> {
        if seq_no == 0 {
            return Ok(Some(LedgerRecord::genesis()));
        }
        let shard = shard_no(seq_no, PRIMARY_SHARD_SIZE);
        let shard_db = self.primary_shard_db(shard);
        if !shard_db.exists() {
            return Ok(None);
        }
        let conn = self.open_primary(shard, false)?;
        Ok(conn
            .query_row(SELECT_LEDGER_BY_SEQ_NO, params![seq_no as i64], row_to_record)
            .optional()?)
    }

    pub fn get_users_by_seq_no(&self, seq_no: u64) -> NodeResult<Vec<Vec<u8>>> {
        let Some(conn) = self.raw_conn_for(seq_no)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare("SELECT pubkey FROM users WHERE ledger_seq_no=?")?;
        let rows = stmt.query_map(params![seq_no as i64], |row| row.get::<_, Vec<u8>>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_user_inputs_by_seq_no(
        &self,
        seq_no: u64,
        user_filter: Option<&[u8]>,
    ) -> NodeResult<Vec<LedgerUserInput>> {
        let Some(conn) = self.raw_conn_for(seq_no)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare("SELECT * FROM inputs WHERE ledger_seq_no=?")?;
        let rows = stmt.query_map(params![seq_no as i64], row_to_input)?;
        let mut inputs = rows.collect::<Result<Vec<_>, _>>()?;
        if let Some(filter) = user_filter {
            inputs.retain(|input| input.pubkey == filter);
        }
        Ok(inputs)
    }

    pub fn get_user_outputs_by_seq_no(
        &self,
        seq_no: u64,
        user_filter: Option<&[u8]>,
    ) -> NodeResult<Vec<LedgerUserOutput>> {
        let Some(conn) = self.raw_conn_for(seq_no)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare("SELECT * FROM outputs WHERE ledger_seq_no=?")?;
        let rows = stmt.query_map(params![seq_no as i64], row_to_output)?;
        let mut outputs = rows.collect::<Result<Vec<_>, _>>()?;
        if let Some(filter) = user_filter {
            outputs.retain(|output| output.pubkey == filter);
        }
        Ok(outputs)
    }

    /// Looks an input up by its fingerprint, newest shard first. Also
    /// returns the ledger record it was committed in.
    pub fn get_user_input_by_hash(
        &self,
        hash: &H32,
    ) -> NodeResult<Option<(LedgerUserInput, Option<LedgerRecord>)>> {
        let Some(raw_dir) = &self.raw_dir else {
            return Ok(None);
        };
        for shard in list_shards(raw_dir)?.iter().rev() {
            let conn = self.open_raw(*shard)?;
            let input = conn
                .query_row(
                    "SELECT * FROM inputs WHERE hash=?",
                    params![hash.as_bytes()],
                    row_to_input,
                )
                .optional()?;
            if let Some(input) = input {
                let record = self.get_ledger_by_seq_no(input.ledger_seq_no)?;
                return Ok(Some((input, record)));
            }
        }
        Ok(None)
    }

    /// Reads an input's payload back from the shard blob store.
    pub fn read_input_payload(&self, input: &LedgerUserInput) -> NodeResult<Vec<u8>> {
        let raw_dir = self
            .raw_dir
            .as_ref()
            .ok_or_else(|| NodeError::RangeEmpty("raw shards disabled".into()))?;
        let shard_dir = raw_dir.join(shard_no(input.ledger_seq_no, RAW_SHARD_SIZE).to_string());
        let blobs = BufferStore::open(&shard_dir.join(RAW_BLOBS))?;
        blobs.read_buf(&crate::buffer::BufferView {
            offset: input.blob_offset,
            size: input.blob_size,
        })
    }

    /// Reads a user's output buffers back from the shard blob store.
    pub fn read_output_payloads(&self, output: &LedgerUserOutput) -> NodeResult<Vec<Vec<u8>>> {
        let raw_dir = self
            .raw_dir
            .as_ref()
            .ok_or_else(|| NodeError::RangeEmpty("raw shards disabled".into()))?;
        let shard_dir = raw_dir.join(shard_no(output.ledger_seq_no, RAW_SHARD_SIZE).to_string());
        let mut file = File::open(shard_dir.join(RAW_BLOBS))?;
        file.seek(SeekFrom::Start(output.blob_offset as u64))?;
        let mut buffers = Vec::with_capacity(output.blob_count as usize);
        for _ in 0..output.blob_count {
            let mut len_bytes = [0u8; 4];
            file.read_exact(&mut len_bytes)?;
            let mut buf = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
            file.read_exact(&mut buf)?;
            buffers.push(buf);
        }
        Ok(buffers)
    }

    fn raw_conn_for(&self, seq_no: u64) -> NodeResult<Option<Connection>> {
        let Some(raw_dir) = &self.raw_dir else {
            return Ok(None);
        };
        let shard_dir = raw_dir.join(shard_no(seq_no, RAW_SHARD_SIZE).to_string());
        if !shard_dir.join(RAW_DB).exists() {
            return Ok(None);
        }
        Ok(Some(self.open_raw(shard_no(seq_no, RAW_SHARD_SIZE))?))
    }

    fn primary_shard_db(&self, shard: u64) -> PathBuf {
        self.primary_dir.join(shard.to_string()).join(PRIMARY_DB)
    }

    fn open_primary(&self, shard: u64, create: bool) -> NodeResult<Connection> {
        let shard_dir = self.primary_dir.join(shard.to_string());
        if create {
            fs::create_dir_all(&shard_dir)?;
        }
        let path = shard_dir.join(PRIMARY_DB);
        let fresh = !path.exists();
        if fresh && !create {
            return Err(NodeError::RangeEmpty(format!("missing primary shard {shard}")));
        }
        let conn = Connection::open(&path)?;
        self.configure(&conn)?;
        if fresh {
            conn.execute_batch(CREATE_LEDGER_TABLE)?;
            conn.execute_batch(
                "CREATE UNIQUE INDEX idx_ledger_time ON ledger(time);\
                 CREATE UNIQUE INDEX idx_ledger_ledger_hash ON ledger(ledger_hash);",
            )?;
            conn.execute_batch(CREATE_HP_TABLE)?;
            conn.execute(
                "INSERT INTO hp(ledger_version) VALUES(?)",
                params![self.ledger_version],
            )?;
        }
        Ok(conn)
    }

    fn open_raw(&self, shard: u64) -> NodeResult<Connection> {
        let raw_dir = self
            .raw_dir
            .as_ref()
            .ok_or_else(|| NodeError::RangeEmpty("raw shards disabled".into()))?;
        let path = raw_dir.join(shard.to_string()).join(RAW_DB);
        let fresh = !path.exists();
        let conn = Connection::open(&path)?;
        self.configure(&conn)?;
        if fresh {
            conn.execute_batch(CREATE_USERS_TABLE)?;
            conn.execute_batch(CREATE_INPUTS_TABLE)?;
            conn.execute_batch(CREATE_OUTPUTS_TABLE)?;
            conn.execute_batch(
                "CREATE INDEX idx_users_ledger_seq_no ON users(ledger_seq_no);\
                 CREATE INDEX idx_users_pubkey ON users(pubkey);\
                 CREATE INDEX idx_inputs_ledger_seq_no ON inputs(ledger_seq_no);\
                 CREATE INDEX idx_inputs_hash ON inputs(hash);\
                 CREATE INDEX idx_inputs_ledger_seq_no_pubkey ON inputs(ledger_seq_no,pubkey);\
                 CREATE INDEX idx_outputs_ledger_seq_no ON outputs(ledger_seq_no);\
                 CREATE INDEX idx_outputs_hash ON outputs(hash);\
                 CREATE INDEX idx_outputs_ledger_seq_no_pubkey ON outputs(ledger_seq_no,pubkey);",
            )?;
            conn.execute_batch(CREATE_HP_TABLE)?;
            conn.execute(
                "INSERT INTO hp(ledger_version) VALUES(?)",
                params![self.ledger_version],
            )?;
        }
        Ok(conn)
    }

    fn configure(&self, conn: &Connection) -> NodeResult<()> {
        // Journaling adds filesystem traffic the content-addressed backing
        // store amplifies, so it is optional; round writes stay transactional
        // either way.
        if !self.journal {
            let _mode: String =
                conn.query_row("PRAGMA journal_mode=OFF", [], |row| row.get(0))?;
        }
        Ok(())
    }

    fn prune_shards(&self) -> NodeResult<()> {
        if self.max_primary_shards > 0 {
            prune_dir(&self.primary_dir, self.max_primary_shards)?;
        }
        if let Some(raw_dir) = &self.raw_dir {
            if self.max_raw_shards > 0 {
                prune_dir(raw_dir, self.max_raw_shards)?;
            }
        }
        Ok(())
    }
}

fn prune_dir(dir: &Path, keep: u64) -> NodeResult<()> {
    let shards = list_shards(dir)?;
    if shards.len() as u64 <= keep {
        return Ok(());
    }
    let excess = shards.len() as u64 - keep;
    for shard in shards.into_iter().take(excess as usize) {
        debug!(shard, dir = %dir.display(), "pruning expired shard");
        if let Err(err) = fs::remove_dir_all(dir.join(shard.to_string())) {
            warn!(shard, ?err, "failed to prune shard");
        }
    }
    Ok(())
}

fn list_shards(dir: &Path) -> NodeResult<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(shard) = entry.file_name().to_string_lossy().parse::<u64>() {
            shards.push(shard);
        }
    }
    shards.sort_unstable();
    Ok(shards)
}

fn get_h32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<H32> {
    let bytes: Vec<u8> = row.get(idx)?;
    H32::from_slice(&bytes).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            "hash column must hold exactly 32 bytes".into(),
        )
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRecord> {
    Ok(LedgerRecord {
        seq_no: row.get::<_, i64>(0)? as u64,
        timestamp: row.get::<_, i64>(1)? as u64,
        ledger_hash: get_h32(row, 2)?,
        prev_ledger_hash: get_h32(row, 3)?,
        data_hash: get_h32(row, 4)?,
        state_hash: get_h32(row, 5)?,
        config_hash: get_h32(row, 6)?,
        nonce: get_h32(row, 7)?,
        user_hash: get_h32(row, 8)?,
        input_hash: get_h32(row, 9)?,
        output_hash: get_h32(row, 10)?,
    })
}

fn row_to_input(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerUserInput> {
    Ok(LedgerUserInput {
        ledger_seq_no: row.get::<_, i64>(0)? as u64,
        pubkey: row.get(1)?,
        hash: get_h32(row, 2)?,
        nonce: row.get::<_, i64>(3)? as u64,
        blob_offset: row.get(4)?,
        blob_size: row.get::<_, i64>(5)? as u32,
    })
}

fn row_to_output(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerUserOutput> {
    Ok(LedgerUserOutput {
        ledger_seq_no: row.get::<_, i64>(0)? as u64,
        pubkey: row.get(1)?,
        hash: get_h32(row, 2)?,
        blob_offset: row.get(3)?,
        blob_count: row.get::<_, i64>(4)? as u32,
    })
}
