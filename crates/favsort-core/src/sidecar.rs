//! Favorites index databases kept next to the cache.
//!
//! Some client versions store an SQLite table of favorited items whose row
//! order is the display order. When one is found and readable its ranks take
//! precedence over every name- or time-derived key. Missing, encrypted or
//! unfamiliar databases are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::{Connection, OpenFlags};
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

const INDEX_NAMES: &[&str] = &[
    "favorite.db",
    "favorites.db",
    "FavoritesItem.db",
    "Favorites.db",
    "favoriteItem.db",
    "FavoriteStorage.db",
    "FavStorage.db",
    "WxFavorite.db",
    "wxfavorite.db",
    "fav.db",
    "Fav.db",
];

// Tried in turn; the first one that runs and returns named rows wins
const QUERIES: &[&str] = &[
    "SELECT fileName FROM FavoritesItem ORDER BY createTime ASC",
    "SELECT fileName FROM FavoritesItem ORDER BY updateTime ASC",
    "SELECT fileName FROM FavoritesItem ORDER BY seq ASC",
    "SELECT fileName FROM FavoritesItem ORDER BY id ASC",
    "SELECT fileName FROM favorites ORDER BY createTime ASC",
    "SELECT fileName FROM favoriteItem ORDER BY createTime ASC",
    "SELECT fileName FROM FavoritesItem ORDER BY localId ASC",
    "SELECT fileName FROM favorites ORDER BY itemId ASC",
    "SELECT fileName FROM favoriteItem ORDER BY id ASC",
];

const ACCOUNT_WALK_DEPTH: usize = 4;

/// File name to row rank, read from one index database.
#[derive(Debug, Clone)]
pub struct SidecarIndex {
    pub path: PathBuf,
    ranks: HashMap<String, u64>,
}

impl SidecarIndex {
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Rank of a cache file, matched on its full name and then on its stem.
    pub fn rank_of(&self, name: &str) -> Option<u64> {
        if let Some(rank) = self.ranks.get(name) {
            return Some(*rank);
        }
        let stem = Path::new(name).file_stem()?.to_str()?;
        self.ranks.get(stem).copied()
    }
}

fn named_index_in(dir: &Path) -> Option<PathBuf> {
    INDEX_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn ancestor_named<'p>(path: &'p Path, matches: impl Fn(&str) -> bool) -> Option<&'p Path> {
    path.ancestors().find(|dir| {
        dir.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(&matches)
    })
}

fn is_db_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("db"))
}

fn walk_for_db(dir: &Path, max_depth: usize, accept: impl Fn(&str) -> bool) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_db_file(e.path()))
        .find(|e| accept(&e.file_name().to_string_lossy().to_lowercase()))
        .map(|e| e.into_path())
}

/// Find an index database for a favorites folder.
///
/// Looks for the known names in the folder, its parent, the enclosing
/// `FileStorage` and `wxid_*` directories, then for any `*fav*.db` under the
/// account and finally any `.db` under the folder itself.
pub fn locate_index(favorites_root: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<&Path> = vec![favorites_root];
    dirs.extend(favorites_root.parent());
    dirs.extend(ancestor_named(favorites_root, |n| n == "FileStorage"));
    let account = ancestor_named(favorites_root, |n| n.starts_with("wxid_"));
    dirs.extend(account);

    if let Some(found) = dirs.into_iter().find_map(named_index_in) {
        return Some(found);
    }
    if let Some(account) = account {
        let found = walk_for_db(account, ACCOUNT_WALK_DEPTH, |n| n.contains("fav"));
        if found.is_some() {
            return found;
        }
    }
    walk_for_db(favorites_root, usize::MAX, |_| true)
}

fn rows_of(conn: &Connection, query: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
    let mut names = Vec::new();
    for name in rows {
        if let Some(name) = name? {
            let name: String = name.trim().nfc().collect();
            if !name.is_empty() {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Read ranks from `db`, or None when no known table layout yields rows.
pub fn read_index(db: &Path) -> Option<SidecarIndex> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match Connection::open_with_flags(db, flags) {
        Ok(c) => c,
        Err(e) => {
            debug!("Cannot open index {}: {}", db.display(), e);
            return None;
        }
    };

    for query in QUERIES {
        match rows_of(&conn, query) {
            Ok(names) if !names.is_empty() => {
                let mut ranks = HashMap::with_capacity(names.len());
                for (rank, name) in names.into_iter().enumerate() {
                    // Earliest row wins for repeated names
                    ranks.entry(name).or_insert(rank as u64);
                }
                info!("Using favorites index {} ({} rows)", db.display(), ranks.len());
                return Some(SidecarIndex {
                    path: db.to_path_buf(),
                    ranks,
                });
            }
            Ok(_) => debug!("Index query returned no rows: {}", query),
            Err(e) => debug!("Index query failed: {}: {}", query, e),
        }
    }
    debug!("No usable table in {}", db.display());
    None
}

/// Locate and read the index for `favorites_root`, if any.
pub fn load(favorites_root: &Path) -> Option<SidecarIndex> {
    let db = locate_index(favorites_root)?;
    read_index(&db)
}
