//! C4: catalogue store. Typed accessors over the four collections (images,
//! faces, persons, folders), backed by a pooled SQLite connection in the
//! teacher's style (see `SqliteRepository` in the original GalleryNet). Each
//! accessor is a single statement against a single table: no accessor here
//! spans a transaction across tables, which is how "multi-document
//! consistency is not assumed" (spec.md §4.4) is upheld structurally.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Condvar, Mutex};
use uuid::Uuid;

use crate::domain::{
    CatalogError, CatalogueStore, Face, FaceMetadata, Folder, Image, ImageMetadata, Person,
    ProcessingState,
};

const POOL_SIZE: usize = 4;

pub struct SqliteCatalogue {
    pool: Mutex<Vec<Connection>>,
    available: Condvar,
}

impl SqliteCatalogue {
    pub fn new(path: &str) -> Result<Self, CatalogError> {
        let conn = Self::open_conn(path)?;
        Self::init_schema(&conn)?;

        let mut connections = vec![conn];
        for _ in 1..POOL_SIZE {
            connections.push(Self::open_conn(path)?);
        }

        Ok(Self {
            pool: Mutex::new(connections),
            available: Condvar::new(),
        })
    }

    pub fn new_in_memory() -> Result<Self, CatalogError> {
        Self::new(":memory:")
    }

    fn open_conn(path: &str) -> Result<Connection, CatalogError> {
        let conn = Connection::open(path)
            .map_err(|e| CatalogError::Database(format!("failed to open {path}: {e}")))?;
        let _ = conn.execute("PRAGMA journal_mode=WAL", []);
        let _ = conn.execute("PRAGMA busy_timeout=30000", []);
        let _ = conn.execute("PRAGMA synchronous=NORMAL", []);
        let _ = conn.execute("PRAGMA foreign_keys=ON", []);
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<(), CatalogError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS folders (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id BLOB REFERENCES folders(id) ON DELETE CASCADE,
                path TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_folders_path ON folders(path);

            CREATE TABLE IF NOT EXISTS persons (
                id BLOB PRIMARY KEY,
                name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                representative_face_id BLOB,
                best_face_score REAL NOT NULL DEFAULT 0.0
            );
            CREATE INDEX IF NOT EXISTS idx_persons_name ON persons(name);
            CREATE INDEX IF NOT EXISTS idx_persons_created_at ON persons(created_at);

            CREATE TABLE IF NOT EXISTS images (
                id BLOB PRIMARY KEY,
                stored_filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                absolute_path TEXT NOT NULL,
                thumbnail_path TEXT,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                is_uploaded INTEGER NOT NULL DEFAULT 0,
                relative_path TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                folder_id BLOB REFERENCES folders(id) ON DELETE SET NULL,
                face_ids_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_images_state ON images(state);
            CREATE INDEX IF NOT EXISTS idx_images_uploaded_at ON images(uploaded_at);
            CREATE INDEX IF NOT EXISTS idx_images_is_uploaded ON images(is_uploaded);

            CREATE TABLE IF NOT EXISTS faces (
                id BLOB PRIMARY KEY,
                image_id BLOB NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                person_id BLOB REFERENCES persons(id) ON DELETE SET NULL,
                top INTEGER NOT NULL,
                right INTEGER NOT NULL,
                bottom INTEGER NOT NULL,
                left INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                thumbnail_path TEXT,
                created_at TEXT NOT NULL,
                det_score REAL NOT NULL DEFAULT 0.0,
                age INTEGER,
                gender INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_faces_image_id ON faces(image_id);
            CREATE INDEX IF NOT EXISTS idx_faces_person_id ON faces(person_id);
            ",
        )
        .map_err(|e| CatalogError::Database(format!("schema init failed: {e}")))?;
        Ok(())
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&Connection) -> Result<T, CatalogError>,
    {
        let mut conn = {
            let mut pool = self.pool.lock().unwrap();
            loop {
                if let Some(conn) = pool.pop() {
                    break conn;
                }
                pool = self.available.wait(pool).unwrap();
            }
        };
        let result = f(&conn);
        // Connections are returned even on error so the pool never starves.
        self.pool.lock().unwrap().push(std::mem::replace(
            &mut conn,
            Connection::open_in_memory().expect("scratch connection"),
        ));
        self.available.notify_one();
        result
    }

    fn image_from_row(row: &rusqlite::Row) -> rusqlite::Result<Image> {
        let id: Vec<u8> = row.get(0)?;
        let stored_filename: String = row.get(1)?;
        let original_filename: String = row.get(2)?;
        let absolute_path: String = row.get(3)?;
        let thumbnail_path: Option<String> = row.get(4)?;
        let width: i64 = row.get(5)?;
        let height: i64 = row.get(6)?;
        let size_bytes: i64 = row.get(7)?;
        let mime_type: String = row.get(8)?;
        let uploaded_at: String = row.get(9)?;
        let state: String = row.get(10)?;
        let is_uploaded: i64 = row.get(11)?;
        let relative_path: String = row.get(12)?;
        let metadata_json: String = row.get(13)?;
        let folder_id: Option<Vec<u8>> = row.get(14)?;
        let face_ids_json: String = row.get(15)?;

        Ok(Image {
            id: uuid_from_bytes(&id)?,
            stored_filename,
            original_filename,
            absolute_path,
            thumbnail_path,
            width: width as u32,
            height: height as u32,
            size_bytes,
            mime_type,
            uploaded_at: parse_rfc3339(&uploaded_at)?,
            state: ProcessingState::from_str(&state),
            is_uploaded: is_uploaded != 0,
            relative_path,
            metadata: serde_json::from_str::<ImageMetadata>(&metadata_json).unwrap_or_default(),
            folder_id: folder_id.map(|b| uuid_from_bytes(&b)).transpose()?,
            face_ids: serde_json::from_str::<Vec<Uuid>>(&face_ids_json).unwrap_or_default(),
        })
    }

    fn face_from_row(row: &rusqlite::Row) -> rusqlite::Result<Face> {
        let id: Vec<u8> = row.get(0)?;
        let image_id: Vec<u8> = row.get(1)?;
        let person_id: Option<Vec<u8>> = row.get(2)?;
        let top: i64 = row.get(3)?;
        let right: i64 = row.get(4)?;
        let bottom: i64 = row.get(5)?;
        let left: i64 = row.get(6)?;
        let embedding: Vec<u8> = row.get(7)?;
        let thumbnail_path: Option<String> = row.get(8)?;
        let created_at: String = row.get(9)?;
        let det_score: f64 = row.get(10)?;
        let age: Option<i64> = row.get(11)?;
        let gender: Option<i64> = row.get(12)?;

        Ok(Face {
            id: uuid_from_bytes(&id)?,
            image_id: uuid_from_bytes(&image_id)?,
            person_id: person_id.map(|b| uuid_from_bytes(&b)).transpose()?,
            top: top as i32,
            right: right as i32,
            bottom: bottom as i32,
            left: left as i32,
            embedding,
            thumbnail_path,
            created_at: parse_rfc3339(&created_at)?,
            metadata: FaceMetadata {
                det_score: det_score as f32,
                age: age.map(|a| a as i32),
                gender: gender.map(|g| g as i32),
            },
        })
    }

    fn person_from_row(row: &rusqlite::Row) -> rusqlite::Result<Person> {
        let id: Vec<u8> = row.get(0)?;
        let name: Option<String> = row.get(1)?;
        let created_at: String = row.get(2)?;
        let updated_at: String = row.get(3)?;
        let representative_face_id: Option<Vec<u8>> = row.get(4)?;
        let best_face_score: f64 = row.get(5)?;

        Ok(Person {
            id: uuid_from_bytes(&id)?,
            name,
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
            representative_face_id: representative_face_id
                .map(|b| uuid_from_bytes(&b))
                .transpose()?,
            best_face_score: best_face_score as f32,
        })
    }

    fn folder_from_row(row: &rusqlite::Row) -> rusqlite::Result<Folder> {
        let id: Vec<u8> = row.get(0)?;
        let name: String = row.get(1)?;
        let parent_id: Option<Vec<u8>> = row.get(2)?;
        let path: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;

        Ok(Folder {
            id: uuid_from_bytes(&id)?,
            name,
            parent_id: parent_id.map(|b| uuid_from_bytes(&b)).transpose()?,
            path,
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
        })
    }
}

fn uuid_from_bytes(bytes: &[u8]) -> rusqlite::Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl CatalogueStore for SqliteCatalogue {
    fn insert_image(&self, image: &Image) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO images (
                    id, stored_filename, original_filename, absolute_path, thumbnail_path,
                    width, height, size_bytes, mime_type, uploaded_at, state, is_uploaded,
                    relative_path, metadata_json, folder_id, face_ids_json
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    image.id.as_bytes(),
                    image.stored_filename,
                    image.original_filename,
                    image.absolute_path,
                    image.thumbnail_path,
                    image.width,
                    image.height,
                    image.size_bytes,
                    image.mime_type,
                    image.uploaded_at.to_rfc3339(),
                    image.state.as_str(),
                    image.is_uploaded as i64,
                    image.relative_path,
                    serde_json::to_string(&image.metadata).unwrap_or_default(),
                    image.folder_id.map(|id| id.as_bytes().to_vec()),
                    serde_json::to_string(&image.face_ids).unwrap_or_default(),
                ],
            )?;
            Ok(())
        })
    }

    fn update_image_state(&self, id: Uuid, state: ProcessingState) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE images SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn set_image_faces(&self, id: Uuid, face_ids: &[Uuid]) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE images SET face_ids_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(face_ids).unwrap_or_default(), id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn set_image_uploaded(&self, id: Uuid, uploaded: bool) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE images SET is_uploaded = ?1 WHERE id = ?2",
                params![uploaded as i64, id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn get_image(&self, id: Uuid) -> Result<Option<Image>, CatalogError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, stored_filename, original_filename, absolute_path, thumbnail_path,
                        width, height, size_bytes, mime_type, uploaded_at, state, is_uploaded,
                        relative_path, metadata_json, folder_id, face_ids_json
                 FROM images WHERE id = ?1",
                params![id.as_bytes()],
                Self::image_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
        })
    }

    fn find_images_pending_upload(&self) -> Result<Vec<Image>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, stored_filename, original_filename, absolute_path, thumbnail_path,
                        width, height, size_bytes, mime_type, uploaded_at, state, is_uploaded,
                        relative_path, metadata_json, folder_id, face_ids_json
                 FROM images WHERE is_uploaded = 0",
            )?;
            let rows = stmt.query_map([], Self::image_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn all_images(&self) -> Result<Vec<Image>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, stored_filename, original_filename, absolute_path, thumbnail_path,
                        width, height, size_bytes, mime_type, uploaded_at, state, is_uploaded,
                        relative_path, metadata_json, folder_id, face_ids_json
                 FROM images",
            )?;
            let rows = stmt.query_map([], Self::image_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn delete_image(&self, id: Uuid) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM images WHERE id = ?1", params![id.as_bytes()])?;
            Ok(())
        })
    }

    fn insert_face(&self, face: &Face) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO faces (
                    id, image_id, person_id, top, right, bottom, left, embedding,
                    thumbnail_path, created_at, det_score, age, gender
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    face.id.as_bytes(),
                    face.image_id.as_bytes(),
                    face.person_id.map(|id| id.as_bytes().to_vec()),
                    face.top,
                    face.right,
                    face.bottom,
                    face.left,
                    face.embedding,
                    face.thumbnail_path,
                    face.created_at.to_rfc3339(),
                    face.metadata.det_score,
                    face.metadata.age,
                    face.metadata.gender,
                ],
            )?;
            Ok(())
        })
    }

    fn set_face_thumbnail(&self, id: Uuid, path: &str) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE faces SET thumbnail_path = ?1 WHERE id = ?2",
                params![path, id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn set_face_person(&self, id: Uuid, person_id: Option<Uuid>) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE faces SET person_id = ?1 WHERE id = ?2",
                params![person_id.map(|p| p.as_bytes().to_vec()), id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn get_face(&self, id: Uuid) -> Result<Option<Face>, CatalogError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, image_id, person_id, top, right, bottom, left, embedding,
                        thumbnail_path, created_at, det_score, age, gender
                 FROM faces WHERE id = ?1",
                params![id.as_bytes()],
                Self::face_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
        })
    }

    fn faces_for_person(&self, person_id: Uuid) -> Result<Vec<Face>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image_id, person_id, top, right, bottom, left, embedding,
                        thumbnail_path, created_at, det_score, age, gender
                 FROM faces WHERE person_id = ?1",
            )?;
            let rows = stmt.query_map(params![person_id.as_bytes()], Self::face_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn all_faces(&self) -> Result<Vec<Face>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image_id, person_id, top, right, bottom, left, embedding,
                        thumbnail_path, created_at, det_score, age, gender
                 FROM faces",
            )?;
            let rows = stmt.query_map([], Self::face_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn delete_face(&self, id: Uuid) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM faces WHERE id = ?1", params![id.as_bytes()])?;
            Ok(())
        })
    }

    fn remove_face_from_image(&self, image_id: Uuid, face_id: Uuid) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            let face_ids_json: String = conn.query_row(
                "SELECT face_ids_json FROM images WHERE id = ?1",
                params![image_id.as_bytes()],
                |row| row.get(0),
            )?;
            let mut ids: Vec<Uuid> = serde_json::from_str(&face_ids_json).unwrap_or_default();
            ids.retain(|id| *id != face_id);
            conn.execute(
                "UPDATE images SET face_ids_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&ids).unwrap_or_default(), image_id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn count_faces_for_person(&self, person_id: Uuid) -> Result<i64, CatalogError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM faces WHERE person_id = ?1",
                params![person_id.as_bytes()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    fn clear_all_face_persons(&self) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE faces SET person_id = NULL", [])?;
            Ok(())
        })
    }

    fn insert_person(&self, person: &Person) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO persons (
                    id, name, created_at, updated_at, representative_face_id, best_face_score
                ) VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    person.id.as_bytes(),
                    person.name,
                    person.created_at.to_rfc3339(),
                    person.updated_at.to_rfc3339(),
                    person.representative_face_id.map(|id| id.as_bytes().to_vec()),
                    person.best_face_score,
                ],
            )?;
            Ok(())
        })
    }

    fn get_person(&self, id: Uuid) -> Result<Option<Person>, CatalogError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at, updated_at, representative_face_id, best_face_score
                 FROM persons WHERE id = ?1",
                params![id.as_bytes()],
                Self::person_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
        })
    }

    fn all_persons(&self) -> Result<Vec<Person>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, created_at, updated_at, representative_face_id, best_face_score
                 FROM persons",
            )?;
            let rows = stmt.query_map([], Self::person_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn update_person_representative(
        &self,
        id: Uuid,
        representative_face_id: Uuid,
        best_face_score: f32,
    ) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE persons SET representative_face_id = ?1, best_face_score = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    representative_face_id.as_bytes(),
                    best_face_score,
                    Utc::now().to_rfc3339(),
                    id.as_bytes(),
                ],
            )?;
            Ok(())
        })
    }

    fn rename_person(&self, id: Uuid, name: Option<String>) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE persons SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, Utc::now().to_rfc3339(), id.as_bytes()],
            )?;
            Ok(())
        })
    }

    fn delete_person(&self, id: Uuid) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM persons WHERE id = ?1", params![id.as_bytes()])?;
            Ok(())
        })
    }

    fn delete_all_persons(&self) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM persons", [])?;
            Ok(())
        })
    }

    fn get_or_create_folder_path(&self, relative_path: &str) -> Result<Option<Uuid>, CatalogError> {
        let trimmed = relative_path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(None);
        }

        self.with_conn(|conn| {
            let mut parent_id: Option<Uuid> = None;
            let mut current_path = String::new();

            for part in trimmed.split('/') {
                if part.is_empty() {
                    continue;
                }
                current_path = if current_path.is_empty() {
                    part.to_string()
                } else {
                    format!("{current_path}/{part}")
                };

                // Idempotent upsert: retry the lookup on a duplicate insert
                // caused by a concurrent caller materialising the same
                // prefix (spec.md §4.5).
                let existing: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT id FROM folders WHERE path = ?1",
                        params![current_path],
                        |row| row.get(0),
                    )
                    .optional()?;

                let folder_id = if let Some(bytes) = existing {
                    uuid_from_bytes(&bytes)?
                } else {
                    let new_id = Uuid::new_v4();
                    let now = Utc::now().to_rfc3339();
                    let insert_result = conn.execute(
                        "INSERT OR IGNORE INTO folders (id, name, parent_id, path, created_at, updated_at)
                         VALUES (?1,?2,?3,?4,?5,?6)",
                        params![
                            new_id.as_bytes(),
                            part,
                            parent_id.map(|p| p.as_bytes().to_vec()),
                            current_path,
                            now,
                            now,
                        ],
                    )?;
                    if insert_result == 0 {
                        // Lost the race: someone else inserted this path first.
                        let bytes: Vec<u8> = conn.query_row(
                            "SELECT id FROM folders WHERE path = ?1",
                            params![current_path],
                            |row| row.get(0),
                        )?;
                        uuid_from_bytes(&bytes)?
                    } else {
                        new_id
                    }
                };

                parent_id = Some(folder_id);
            }

            Ok(parent_id)
        })
    }

    fn all_folders(&self) -> Result<Vec<Folder>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, parent_id, path, created_at, updated_at FROM folders",
            )?;
            let rows = stmt.query_map([], Self::folder_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn truncate_all(&self) -> Result<(), CatalogError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM faces; DELETE FROM images; DELETE FROM persons; DELETE FROM folders;",
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub struct TestDb {
    pub path: String,
}

#[cfg(test)]
impl TestDb {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("{prefix}_{}.db", Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        Self { path }
    }

    pub fn open(&self) -> SqliteCatalogue {
        SqliteCatalogue::new(&self.path).unwrap()
    }
}

#[cfg(test)]
impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(format!("{}-wal", self.path));
        let _ = std::fs::remove_file(format!("{}-shm", self.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FaceMetadata, ImageMetadata};

    fn sample_image(relative_path: &str) -> Image {
        Image {
            id: Uuid::new_v4(),
            stored_filename: "abc.jpg".into(),
            original_filename: "original.jpg".into(),
            absolute_path: format!("/import/{relative_path}"),
            thumbnail_path: None,
            width: 800,
            height: 600,
            size_bytes: 1000,
            mime_type: "image/jpeg".into(),
            uploaded_at: Utc::now(),
            state: ProcessingState::Pending,
            is_uploaded: false,
            relative_path: relative_path.to_string(),
            metadata: ImageMetadata::default(),
            folder_id: None,
            face_ids: vec![],
        }
    }

    #[test]
    fn insert_and_get_image_round_trips() {
        let db = TestDb::new("catalogue_image");
        let store = db.open();
        let image = sample_image("a.jpg");
        store.insert_image(&image).unwrap();
        let fetched = store.get_image(image.id).unwrap().unwrap();
        assert_eq!(fetched.relative_path, "a.jpg");
        assert_eq!(fetched.state, ProcessingState::Pending);
    }

    #[test]
    fn update_image_state_persists() {
        let db = TestDb::new("catalogue_state");
        let store = db.open();
        let image = sample_image("b.jpg");
        store.insert_image(&image).unwrap();
        store
            .update_image_state(image.id, ProcessingState::Processed)
            .unwrap();
        let fetched = store.get_image(image.id).unwrap().unwrap();
        assert_eq!(fetched.state, ProcessingState::Processed);
    }

    #[test]
    fn face_and_person_lifecycle() {
        let db = TestDb::new("catalogue_face");
        let store = db.open();
        let image = sample_image("c.jpg");
        store.insert_image(&image).unwrap();

        let person = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            representative_face_id: None,
            best_face_score: 0.0,
        };
        store.insert_person(&person).unwrap();

        let face = Face {
            id: Uuid::new_v4(),
            image_id: image.id,
            person_id: Some(person.id),
            top: 10,
            right: 100,
            bottom: 100,
            left: 10,
            embedding: vec![0u8; 2048],
            thumbnail_path: None,
            created_at: Utc::now(),
            metadata: FaceMetadata { det_score: 0.9, age: None, gender: None },
        };
        store.insert_face(&face).unwrap();

        assert_eq!(store.count_faces_for_person(person.id).unwrap(), 1);
        store
            .update_person_representative(person.id, face.id, 0.9)
            .unwrap();
        let fetched_person = store.get_person(person.id).unwrap().unwrap();
        assert_eq!(fetched_person.representative_face_id, Some(face.id));
        assert_eq!(fetched_person.best_face_score, 0.9);
    }

    #[test]
    fn ensure_folder_is_idempotent_across_prefixes() {
        let db = TestDb::new("catalogue_folder");
        let store = db.open();
        let id1 = store.get_or_create_folder_path("2024/summer").unwrap();
        let id2 = store.get_or_create_folder_path("2024/summer").unwrap();
        assert_eq!(id1, id2);
        let folders = store.all_folders().unwrap();
        assert_eq!(folders.len(), 2); // "2024" and "2024/summer"
    }

    #[test]
    fn get_or_create_folder_path_handles_empty() {
        let db = TestDb::new("catalogue_folder_empty");
        let store = db.open();
        assert_eq!(store.get_or_create_folder_path("").unwrap(), None);
    }
}
