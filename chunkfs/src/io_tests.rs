#[cfg(test)]
mod tests {
    use crate::fs::file_io::{FileIO, ReadInterval};
    use crate::fs::inline::decode_entry;
    use crate::fs::{FileIoRegistry, FsError, XATTR_BACKLINK, XATTR_LAST_CHUNK_SIZE};
    use crate::pool::{MemoryPool, ObjectPool, PoolRef};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn pool() -> Arc<MemoryPool> {
        init_tracing();
        MemoryPool::new("data", 1 << 30)
    }

    fn pool_ref(pool: &Arc<MemoryPool>) -> PoolRef {
        Arc::clone(pool) as PoolRef
    }

    fn file(pool: &Arc<MemoryPool>, inode: &str, chunk_size: u64) -> Arc<FileIO> {
        FileIO::new(pool_ref(pool), inode, chunk_size)
    }

    #[tokio::test]
    async fn test_round_trip_write_read() {
        let pool = pool();
        let io = file(&pool, "ino-rt", 64);

        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        io.write_sync(Bytes::from(payload.clone()), 1000).await.unwrap();

        let back = io.read_scalar(1000, payload.len()).await.unwrap();
        assert_eq!(&back[..], &payload[..]);
        assert_eq!(io.size().await, 1200);
    }

    #[tokio::test]
    async fn test_inline_only_write_read() {
        let pool = pool();
        let io = file(&pool, "ino-s1", 128);
        io.set_inline_buffer("parent-dir", "/dir/file", 16);

        io.write_sync(Bytes::from_static(b"hello"), 0).await.unwrap();

        assert_eq!(io.size().await, 5);
        let back = io.read_scalar(0, 5).await.unwrap();
        assert_eq!(&back[..], b"hello");

        // No chunk holds any data; the bytes live on the parent object.
        assert_eq!(pool.object_len("ino-s1").unwrap_or(0), 0);
        assert!(!pool.object_exists("ino-s1.1"));

        let key = "cfs.inline.file".to_string();
        let entry = pool
            .get_omap_vals_by_keys("parent-dir", std::slice::from_ref(&key))
            .await
            .unwrap()
            .remove(&key)
            .expect("inline entry must exist");
        assert_eq!(&entry[..8], b"00000005");
        assert_eq!(decode_entry(&entry), b"hello");
    }

    #[tokio::test]
    async fn test_inline_plus_chunk() {
        let pool = pool();
        let io = file(&pool, "ino-s2", 16);
        io.set_inline_buffer("parent-dir", "/dir/mixed", 8);

        io.write_sync(Bytes::from_static(b"0123456789abcdefGHIJ"), 0)
            .await
            .unwrap();

        assert_eq!(io.size().await, 20);

        let key = "cfs.inline.mixed".to_string();
        let entry = pool
            .get_omap_vals_by_keys("parent-dir", std::slice::from_ref(&key))
            .await
            .unwrap()
            .remove(&key)
            .unwrap();
        assert_eq!(&entry[..8], b"00000008");
        assert_eq!(decode_entry(&entry), b"01234567");

        // The inline region overlays the head of chunk 0; the rest of
        // the write keeps its file-address alignment.
        let chunk0 = pool.object_data("ino-s2").unwrap();
        assert_eq!(&chunk0[..8], &[0u8; 8]);
        assert_eq!(&chunk0[8..16], b"89abcdef");
        assert_eq!(&pool.object_data("ino-s2.1").unwrap()[..], b"GHIJ");

        let back = io.read_scalar(4, 16).await.unwrap();
        assert_eq!(&back[..], b"456789abcdefGHIJ");
    }

    #[tokio::test]
    async fn test_multi_chunk_aligned_write() {
        init_tracing();
        let pool = MemoryPool::with_alignment("aligned", 1 << 30, 3);
        let io = file(&pool, "ino-s3", 128);

        // The per-file chunk size aligns down to 126.
        assert_eq!(io.chunk_size(), 126);

        io.write_sync(Bytes::from(vec![b'x'; 300]), 0).await.unwrap();

        assert_eq!(io.size().await, 300);
        for chunk in ["ino-s3", "ino-s3.1", "ino-s3.2"] {
            let len = pool.object_len(chunk).expect("chunk must exist");
            assert_eq!(len % 3, 0, "stored length of {chunk} must be aligned");
        }
        // The tail chunk records its logical length.
        assert_eq!(
            pool.get_xattr("ino-s3.2", XATTR_LAST_CHUNK_SIZE).await.unwrap(),
            Bytes::from_static(b"48")
        );

        let back = io.read_scalar(0, 300).await.unwrap();
        assert_eq!(back.len(), 300);
        assert!(back.iter().all(|b| *b == b'x'));
    }

    #[tokio::test]
    async fn test_truncate_up_then_read() {
        let pool = pool();
        let io = file(&pool, "ino-s4", 128);

        io.write_sync(Bytes::from_static(b"A"), 0).await.unwrap();
        io.truncate(1024).await.unwrap();

        assert_eq!(io.size().await, 1024);
        let back = io.read_scalar(0, 1024).await.unwrap();
        assert_eq!(back.len(), 1024);
        assert_eq!(back[0], b'A');
        assert!(back[1..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_zero_hole_after_partial_write() {
        let pool = pool();
        let io = file(&pool, "ino-hole", 32);

        io.write_sync(Bytes::from(vec![b'd'; 40]), 0).await.unwrap();
        io.truncate(100).await.unwrap();

        // Bytes between the last write and the new size read as zero.
        let back = io.read_scalar(40, 60).await.unwrap();
        assert_eq!(back.len(), 60);
        assert!(back.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_monotonic_size_under_concurrent_writes() {
        let pool = pool();
        let io = file(&pool, "ino-mono", 128);

        let writes: &[(u64, usize)] = &[(0, 10), (100, 20), (50, 10), (500, 100), (30, 5)];
        let mut op_ids = Vec::new();
        for (offset, len) in writes {
            let op_id = io.write(Bytes::from(vec![b'm'; *len]), *offset).unwrap();
            op_ids.push(op_id);
        }
        for op_id in op_ids {
            io.sync(&op_id).await.unwrap();
        }

        let expected = writes.iter().map(|(o, l)| o + *l as u64).max().unwrap();
        assert_eq!(io.size().await, expected);
    }

    #[tokio::test]
    async fn test_two_clients_disjoint_single_chunk_writes() {
        let pool = pool();
        let client_a = pool.new_client();
        let client_b = pool.new_client();

        let a = file(&client_a, "ino-s5", 128);
        let b = file(&client_b, "ino-s5", 128);

        let wa = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write_sync(Bytes::from(vec![b'a'; 10]), 0).await })
        };
        let wb = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.write_sync(Bytes::from(vec![b'b'; 10]), 1000).await })
        };
        wa.await.unwrap().unwrap();
        wb.await.unwrap().unwrap();

        let reader = file(&pool, "ino-s5", 128);
        assert_eq!(reader.size().await, 1010);
        assert_eq!(&reader.read_scalar(0, 10).await.unwrap()[..], b"aaaaaaaaaa");
        assert_eq!(&reader.read_scalar(1000, 10).await.unwrap()[..], b"bbbbbbbbbb");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_clients_multi_chunk_mutual_exclusion() {
        init_tracing();
        let pool = MemoryPool::new("data", 1 << 30);

        // Separate mounts: each client gets its own registry, whose
        // idle sweep is what hands the exclusive lock over.
        let registry_a = FileIoRegistry::new();
        let registry_b = FileIoRegistry::new();
        let pool_a = pool_ref(&pool.new_client());
        let pool_b = pool_ref(&pool.new_client());

        let a = registry_a.get_or_insert(&pool_a, "ino-excl", 16);
        let b = registry_b.get_or_insert(&pool_b, "ino-excl", 16);

        let wa = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write_sync(Bytes::from(vec![b'a'; 40]), 0).await })
        };
        let wb = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.write_sync(Bytes::from(vec![b'b'; 40]), 0).await })
        };

        tokio::time::timeout(Duration::from_secs(30), async {
            wa.await.unwrap().unwrap();
            wb.await.unwrap().unwrap();
        })
        .await
        .expect("both exclusive writers must finish");

        // Exactly one linearisation: all 40 bytes come from one writer.
        let reader = file(&pool, "ino-excl", 16);
        let back = reader.read_scalar(0, 40).await.unwrap();
        assert_eq!(back.len(), 40);
        assert!(
            back.iter().all(|x| *x == b'a') || back.iter().all(|x| *x == b'b'),
            "chunks must not interleave writers: {:?}",
            back
        );
    }

    #[tokio::test]
    async fn test_truncate_preserves_base_chunk() {
        let pool = pool();
        let io = file(&pool, "ino-trunc", 16);

        io.write_sync(Bytes::from(vec![b't'; 40]), 0).await.unwrap();
        assert!(pool.object_exists("ino-trunc.1"));
        assert!(pool.object_exists("ino-trunc.2"));

        io.truncate(10).await.unwrap();
        assert_eq!(io.size().await, 10);
        assert_eq!(pool.object_len("ino-trunc"), Some(10));
        assert!(!pool.object_exists("ino-trunc.1"));
        assert!(!pool.object_exists("ino-trunc.2"));

        io.truncate(0).await.unwrap();
        assert_eq!(io.size().await, 0);
        assert_eq!(pool.object_len("ino-trunc"), Some(0));
    }

    #[tokio::test]
    async fn test_truncate_to_chunk_boundary_keeps_tail_chunk() {
        let pool = pool();
        let io = file(&pool, "ino-bound", 16);

        io.write_sync(Bytes::from(vec![b'q'; 40]), 0).await.unwrap();
        io.truncate(32).await.unwrap();

        assert_eq!(io.size().await, 32);
        assert_eq!(pool.object_len("ino-bound.1"), Some(16));
        assert!(!pool.object_exists("ino-bound.2"));

        let back = io.read_scalar(0, 32).await.unwrap();
        assert_eq!(back.len(), 32);
        assert!(back.iter().all(|b| *b == b'q'));
    }

    #[tokio::test]
    async fn test_idempotent_backlink() {
        let pool = pool();
        let io = FileIO::new_with_path(pool_ref(&pool), "ino-bl", "/dir/name", 64);

        let op_id = io.update_backlink(None).unwrap();
        io.sync(&op_id).await.unwrap();
        assert!(io.has_backlink());
        assert_eq!(
            pool.get_xattr("ino-bl", XATTR_BACKLINK).await.unwrap(),
            Bytes::from_static(b"/dir/name")
        );

        // Converged: a repeat lands on the CAS and reports Canceled.
        let op_id = io.update_backlink(None).unwrap();
        assert_eq!(io.sync(&op_id).await, Err(FsError::Canceled));
        assert!(io.has_backlink());

        // Rename against the previous value.
        io.set_path("/dir/renamed");
        let op_id = io.update_backlink(Some("/dir/name")).unwrap();
        io.sync(&op_id).await.unwrap();
        assert_eq!(
            pool.get_xattr("ino-bl", XATTR_BACKLINK).await.unwrap(),
            Bytes::from_static(b"/dir/renamed")
        );
    }

    #[tokio::test]
    async fn test_backlink_piggybacks_on_first_write() {
        let pool = pool();
        let io = FileIO::new_with_path(pool_ref(&pool), "ino-bl2", "/d/f", 64);

        assert!(io.should_set_backlink());
        io.write_sync(Bytes::from_static(b"x"), 0).await.unwrap();

        assert!(io.has_backlink());
        assert_eq!(
            pool.get_xattr("ino-bl2", XATTR_BACKLINK).await.unwrap(),
            Bytes::from_static(b"/d/f")
        );
    }

    #[tokio::test]
    async fn test_no_dangling_completions_after_release() {
        let pool = pool();
        let registry = FileIoRegistry::new();
        let pool_ref = pool_ref(&pool);

        let io = registry.get_or_insert(&pool_ref, "ino-close", 32);
        let fired = Arc::new(AtomicBool::new(false));

        for i in 0..4u64 {
            io.write(Bytes::from(vec![b'c'; 48]), i * 100).unwrap();
        }
        {
            let fired = Arc::clone(&fired);
            io.write_with_callback(
                Bytes::from_static(b"last"),
                1000,
                Some(Box::new(move |_, code| {
                    assert_eq!(code, 0);
                    fired.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();
        }

        registry.release(io).await;

        assert!(registry.get("ino-close").is_none());
        assert!(fired.load(Ordering::SeqCst), "callback fires before teardown");

        let reader = file(&pool, "ino-close", 32);
        assert_eq!(reader.size().await, 1004);
    }

    #[tokio::test]
    async fn test_lazy_removal_on_release() {
        let pool = pool();
        let registry = FileIoRegistry::new();
        let pool_ref = pool_ref(&pool);

        let io = registry.get_or_insert(&pool_ref, "ino-lazy", 16);
        io.write_sync(Bytes::from(vec![b'l'; 40]), 0).await.unwrap();
        io.set_lazy_removal(true);

        registry.release(io).await;

        assert!(!pool.object_exists("ino-lazy"));
        assert!(!pool.object_exists("ino-lazy.1"));
        assert!(!pool.object_exists("ino-lazy.2"));

        let reader = file(&pool, "ino-lazy", 16);
        assert_eq!(reader.size().await, 0);
    }

    #[tokio::test]
    async fn test_remove_after_vector_read() {
        let pool = pool();
        let io = file(&pool, "ino-s6", 16);
        io.write_sync(Bytes::from(vec![b'r'; 32]), 0).await.unwrap();

        let (first, first_handle) = ReadInterval::new(0, 16);
        let (second, second_handle) = ReadInterval::new(16, 16);
        let op_id = io.read_vector(vec![first, second], None).await.unwrap();

        // Removal drains outstanding ops before it takes the lock, so
        // the read either completed cleanly or its regions report the
        // missing chunks.
        io.remove().await.unwrap();

        match io.sync(&op_id).await {
            Ok(()) | Err(FsError::NotFound) => {}
            other => panic!("unexpected sync outcome: {:?}", other),
        }
        if first_handle.bytes_read() == 16 {
            assert!(first_handle.read_data().iter().all(|b| *b == b'r'));
        }
        if second_handle.bytes_read() == 16 {
            assert!(second_handle.read_data().iter().all(|b| *b == b'r'));
        }

        assert_eq!(io.size().await, 0);
        assert!(!pool.object_exists("ino-s6"));
        assert!(!pool.object_exists("ino-s6.1"));
    }

    #[tokio::test]
    async fn test_vector_read_fills_intervals_independently() {
        let pool = pool();
        let io = file(&pool, "ino-vec", 16);
        io.set_inline_buffer("parent-dir", "/d/vec", 8);
        io.write_sync(Bytes::from_static(b"0123456789abcdefGHIJ"), 0)
            .await
            .unwrap();

        let (i1, h1) = ReadInterval::new(0, 4);
        let (i2, h2) = ReadInterval::new(6, 6);
        let (i3, h3) = ReadInterval::new(16, 4);
        let op_id = io.read_vector(vec![i1, i2, i3], None).await.unwrap();
        io.sync(&op_id).await.unwrap();

        assert_eq!(h1.bytes_read(), 4);
        assert_eq!(&h1.read_data()[..], b"0123");
        assert_eq!(h2.bytes_read(), 6);
        assert_eq!(&h2.read_data()[..], b"6789ab");
        assert_eq!(h3.bytes_read(), 4);
        assert_eq!(&h3.read_data()[..], b"GHIJ");
    }

    #[tokio::test]
    async fn test_read_callback_receives_aggregate() {
        let pool = pool();
        let io = file(&pool, "ino-cb", 16);
        io.write_sync(Bytes::from_static(b"callback"), 0).await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let (interval, handle) = ReadInterval::new(0, 8);
        let op_id = {
            let fired = Arc::clone(&fired);
            io.read_vector(
                vec![interval],
                Some(Box::new(move |_, code| {
                    assert_eq!(code, 0);
                    fired.store(true, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap()
        };
        io.sync(&op_id).await.unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(&handle.read_data()[..], b"callback");
    }

    #[tokio::test]
    async fn test_short_read_at_eof() {
        let pool = pool();
        let io = file(&pool, "ino-eof", 64);
        io.write_sync(Bytes::from_static(b"0123456789"), 0).await.unwrap();

        let back = io.read_scalar(0, 50).await.unwrap();
        assert_eq!(&back[..], b"0123456789");

        let back = io.read_scalar(4, 50).await.unwrap();
        assert_eq!(&back[..], b"456789");

        // Past the declared size and into a chunk that never existed:
        // nothing covers the range, so the missing object surfaces.
        assert_eq!(io.read_scalar(100, 10).await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_usage_errors() {
        let pool = init_small_pool();
        let io = file(&pool, "ino-err", 16);

        assert_eq!(
            io.write_sync(Bytes::new(), 0).await,
            Err(FsError::InvalidArgument)
        );
        assert_eq!(io.read_scalar(0, 0).await, Err(FsError::InvalidArgument));
        assert_eq!(io.read_vector(Vec::new(), None).await, Err(FsError::InvalidArgument));

        // Past the pool's object size bound.
        assert_eq!(
            io.write_sync(Bytes::from(vec![0; 32]), 100).await,
            Err(FsError::FileTooBig)
        );
        assert_eq!(io.truncate(1000).await, Err(FsError::FileTooBig));
    }

    fn init_small_pool() -> Arc<MemoryPool> {
        init_tracing();
        MemoryPool::new("small", 128)
    }

    #[tokio::test]
    async fn test_registry_shares_handles_by_inode() {
        let pool = pool();
        let registry = FileIoRegistry::new();
        let pool_ref = pool_ref(&pool);

        let first = registry.get_or_insert(&pool_ref, "ino-reg", 64);
        let second = registry.get_or_insert(&pool_ref, "ino-reg", 64);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!FileIoRegistry::is_unique_after_registry(&first));

        drop(second);
        assert!(FileIoRegistry::is_unique_after_registry(&first));

        // A release with another user around keeps the handle alive.
        let extra = Arc::clone(&first);
        registry.release(extra).await;
        assert!(registry.get("ino-reg").is_some());

        registry.release(first).await;
        assert!(registry.get("ino-reg").is_none());
    }

    #[tokio::test]
    async fn test_overwrite_within_chunk() {
        let pool = pool();
        let io = file(&pool, "ino-ow", 64);

        io.write_sync(Bytes::from(vec![b'1'; 32]), 0).await.unwrap();
        io.write_sync(Bytes::from_static(b"xyz"), 10).await.unwrap();

        let back = io.read_scalar(0, 32).await.unwrap();
        assert_eq!(&back[..10], &[b'1'; 10][..]);
        assert_eq!(&back[10..13], b"xyz");
        assert_eq!(&back[13..], &[b'1'; 19][..]);
        // Overwrites never raise the size.
        assert_eq!(io.size().await, 32);
    }

    #[tokio::test]
    async fn test_aligned_truncate_zeroes_tail_in_place() {
        init_tracing();
        let pool = MemoryPool::with_alignment("aligned", 1 << 30, 4);
        let io = file(&pool, "ino-atr", 64);
        assert_eq!(io.chunk_size(), 64);

        io.write_sync(Bytes::from(vec![b'z'; 100]), 0).await.unwrap();
        io.truncate(10).await.unwrap();

        assert_eq!(io.size().await, 10);
        let stored = pool.object_len("ino-atr").unwrap();
        assert_eq!(stored % 4, 0);
        assert!(!pool.object_exists("ino-atr.1"));

        let back = io.read_scalar(0, 10).await.unwrap();
        assert_eq!(&back[..], &[b'z'; 10][..]);

        // The zeroed tail stays zero after growing the file again.
        io.truncate(40).await.unwrap();
        let back = io.read_scalar(0, 40).await.unwrap();
        assert_eq!(&back[..10], &[b'z'; 10][..]);
        assert!(back[10..].iter().all(|b| *b == 0));
    }
}
