// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{Read, Write};
use std::path::Path;

/// Packs the contents of `dir` (an engine save directory) into a tar stream.
pub fn pack_dir(dir: &Path, writer: &mut dyn Write) -> std::io::Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.append_dir_all(".", dir)?;
    builder.finish()
}

/// Unpacks a tar stream into `dir`, creating it if needed.
pub fn unpack_to(reader: &mut dyn Read, dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(reader);
    archive.unpack(dir)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("ndb.json"), b"{\"a\":1}").unwrap();

        let mut buffer = Vec::new();
        pack_dir(source.path(), &mut buffer).unwrap();

        let target = tempfile::tempdir().unwrap();
        unpack_to(&mut buffer.as_slice(), target.path()).unwrap();

        let restored = std::fs::read(target.path().join("ndb.json")).unwrap();
        assert_eq!(restored, b"{\"a\":1}");
    }
}
