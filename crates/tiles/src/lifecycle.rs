use model::TileData;

/// Why a resident tile must stay in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionBlocker {
    Hot,
    Visible,
    /// Holds mutations no store has accepted yet.
    Dirty,
    /// A copy is queued or being written; completion still needs the tile.
    FlushPending,
}

/// Checks every reason to keep `tile`; `None` means it may be dropped.
pub fn eviction_blocker(
    tile: &TileData,
    hot: bool,
    visible: bool,
    flush_pending: bool,
) -> Option<EvictionBlocker> {
    if hot {
        Some(EvictionBlocker::Hot)
    } else if visible {
        Some(EvictionBlocker::Visible)
    } else if flush_pending {
        Some(EvictionBlocker::FlushPending)
    } else if tile.is_dirty() {
        Some(EvictionBlocker::Dirty)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::PixelWrite;

    fn dirty_tile() -> TileData {
        let mut tile = TileData::new(16);
        tile.write_pixel(
            0,
            &PixelWrite {
                stroke_id: 1,
                sections: 0,
                rate: None,
                speed: None,
                front_max_age: 16,
            },
        );
        tile
    }

    #[test]
    fn dirty_or_pending_tiles_are_never_evictable() {
        let mut tile = dirty_tile();
        assert_eq!(
            eviction_blocker(&tile, false, false, false),
            Some(EvictionBlocker::Dirty)
        );
        tile.mark_clean();
        assert_eq!(
            eviction_blocker(&tile, false, false, true),
            Some(EvictionBlocker::FlushPending)
        );
        assert_eq!(eviction_blocker(&tile, false, false, false), None);
    }

    #[test]
    fn membership_blocks_before_state() {
        let tile = TileData::new(16);
        assert_eq!(
            eviction_blocker(&tile, true, true, false),
            Some(EvictionBlocker::Hot)
        );
        assert_eq!(
            eviction_blocker(&tile, false, true, false),
            Some(EvictionBlocker::Visible)
        );
    }
}
